//! Tether - bidirectional object and function proxying over message channels.
//!
//! Each side of a channel runs an [`RpcService`]. A side exposes functions,
//! objects and classes under string ids together with descriptors saying how
//! each member is called; the other side obtains proxies for them and uses
//! the proxies like local handles. Functions, class instances and deferreds
//! passed as arguments or results travel by reference and are proxied in
//! turn, so callbacks work in both directions.
//!
//! The service adapts to whatever the channel supports: sync calls degrade
//! to async over an async-only channel and the other way round.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tether_core::{ChannelMode, MemoryChannel, Object, ObjectDescriptor, Returns,
//!     FunctionDescriptor, RpcService, Value};
//!
//! let (host_end, client_end) = MemoryChannel::pair(ChannelMode::SyncOnly);
//! let host = RpcService::new(Arc::new(host_end))?;
//! let client = RpcService::new(Arc::new(client_end))?;
//!
//! let calc = Object::builder()
//!     .method("add", |_, args| Ok(Value::from(args[0].expect_i64()? + args[1].expect_i64()?)))
//!     .build();
//! host.register_host_object(
//!     "calc",
//!     calc,
//!     ObjectDescriptor::new().function(FunctionDescriptor::new("add").returns(Returns::Sync)),
//! );
//!
//! client.request_remote_descriptors()?;
//! let proxy = client.get_proxy_object("calc")?;
//! let sum = proxy.call_method("add", vec![Value::from(2), Value::from(3)])?;
//! assert_eq!(sum, Value::from(5));
//! ```

pub mod channel;
pub mod config;
pub mod deferred;
pub mod descriptor;
pub mod error;
pub mod liveness;
pub mod object;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod value;

mod serialize;

pub use channel::{message_handler, send_oneway, Channel, ChannelMode, MemoryChannel, MessageHandler};
pub use deferred::Deferred;
pub use descriptor::{
    AccessorDescriptor, ArgumentDescriptor, ClassDescriptor, Descriptor, FunctionDescriptor,
    FunctionEntry, ObjectDescriptor, PropertyDescriptor, PropertyEntry, Returns,
};
pub use error::{Result, TetherError};
pub use liveness::{DisposeGuard, DisposeReason, LivenessRegistry};
pub use object::{this_object, Class, ClassBuilder, Function, Object, ObjectBuilder};
pub use protocol::{CallType, DescriptorSet, RpcMessage};
pub use service::{IdGenerator, RpcService, RpcServiceBuilder, SequentialIds, UuidGenerator};
pub use transport::{TcpChannel, TcpChannelServer};
pub use value::Value;
