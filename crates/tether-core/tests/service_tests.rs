//! End-to-end tests of two services talking over in-process and TCP channels.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_core::{
    this_object, ArgumentDescriptor, ChannelMode, Class, ClassDescriptor, Deferred, Function,
    FunctionDescriptor, MemoryChannel, Object, ObjectDescriptor, PropertyDescriptor, Returns,
    RpcService, SequentialIds, TcpChannel, TcpChannelServer, TetherError, Value,
};

// ============================================================================
// Fixtures
// ============================================================================

fn connect(mode: ChannelMode) -> (RpcService, RpcService) {
    let (host_end, client_end) = MemoryChannel::pair(mode);
    let host = RpcService::builder(Arc::new(host_end))
        .id_generator(SequentialIds::new("host-"))
        .build()
        .unwrap();
    let client = RpcService::builder(Arc::new(client_end))
        .id_generator(SequentialIds::new("client-"))
        .build()
        .unwrap();
    (host, client)
}

fn sync_fn(name: &str) -> FunctionDescriptor {
    FunctionDescriptor::new(name).returns(Returns::Sync)
}

fn calculator(calls: Arc<AtomicUsize>) -> (Object, ObjectDescriptor) {
    let object = Object::builder()
        .method("add", move |_, args| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Value::from(args[0].expect_i64()? + args[1].expect_i64()?))
        })
        .method("fail", |_, _| Err(TetherError::failed("boom")))
        .build();
    let descriptor = ObjectDescriptor::new()
        .function(sync_fn("add"))
        .function(sync_fn("fail"));
    (object, descriptor)
}

fn counter_class() -> (Class, ClassDescriptor) {
    let class = Class::builder("Counter")
        .constructor(|class, args| {
            let label = args.into_iter().next().unwrap_or_else(|| Value::from("counter"));
            Ok(class.instantiate([("label", label), ("value", Value::from(0))]))
        })
        .method("increment", |this, _| {
            let this = this_object(this)?;
            let next = this.get("value")?.expect_i64()? + 1;
            this.set("value", Value::from(next))?;
            Ok(Value::from(next))
        })
        .build();
    let descriptor = ClassDescriptor::new("Counter")
        .ctor(sync_fn("Counter"))
        .instance(
            ObjectDescriptor::new()
                .function(sync_fn("increment"))
                .readonly_property("label")
                .proxied_property(PropertyDescriptor::new("value")),
        );
    (class, descriptor)
}

fn construct(class: &Class, label: &str) -> Object {
    match class.construct(vec![Value::from(label)]).unwrap() {
        Value::Object(object) => object,
        other => panic!("expected an object, got {}", other.kind()),
    }
}

// ============================================================================
// Calls over a sync channel
// ============================================================================

#[test]
fn test_sync_method_call() {
    let (host, client) = connect(ChannelMode::SyncOnly);
    let calls = Arc::new(AtomicUsize::new(0));
    let (calc, descriptor) = calculator(calls.clone());
    host.register_host_object("calc", calc, descriptor);

    client.request_remote_descriptors().unwrap();
    let proxy = client.get_proxy_object("calc").unwrap();
    let sum = proxy
        .call_method("add", vec![Value::from(2), Value::from(3)])
        .unwrap();

    assert_eq!(sum, Value::from(5));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_sync_failure_carries_message() {
    let (host, client) = connect(ChannelMode::SyncOnly);
    let (calc, descriptor) = calculator(Arc::new(AtomicUsize::new(0)));
    host.register_host_object("calc", calc, descriptor);
    client.request_remote_descriptors().unwrap();

    let err = client
        .get_proxy_object("calc")
        .unwrap()
        .call_method("fail", vec![])
        .unwrap_err();
    assert!(matches!(err, TetherError::Remote(_)));
    assert_eq!(err.to_string(), "boom");
}

#[test]
fn test_proxies_are_memoized() {
    let (host, client) = connect(ChannelMode::SyncOnly);
    let (calc, descriptor) = calculator(Arc::new(AtomicUsize::new(0)));
    host.register_host_object("calc", calc, descriptor);
    let (class, descriptor) = counter_class();
    host.register_host_class(class, descriptor);
    client.request_remote_descriptors().unwrap();

    let a = client.get_proxy_object("calc").unwrap();
    let b = client.get_proxy_object("calc").unwrap();
    assert!(a.ptr_eq(&b));

    let c1 = client.get_proxy_class("Counter").unwrap();
    let c2 = client.get_proxy_class("Counter").unwrap();
    assert!(c1.ptr_eq(&c2));

    assert!(matches!(
        client.get_proxy_object("missing"),
        Err(TetherError::NoObject { .. })
    ));
    assert!(matches!(
        client.get_proxy_class("Missing"),
        Err(TetherError::NoClass { .. })
    ));
}

#[test]
fn test_callback_round_trip() {
    let (host, client) = connect(ChannelMode::SyncOnly);
    let call_twice = Function::native("call_twice", |_, args| {
        let callback = args[0].expect_function()?;
        let once = callback.call(vec![args[1].clone()])?;
        callback.call(vec![once])
    });
    host.register_host_function(
        "call_twice",
        call_twice,
        sync_fn("call_twice").argument(ArgumentDescriptor::at(0, sync_fn("callback"))),
    );
    client.request_remote_descriptors().unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();
    let increment = Function::native("increment", move |_, args| {
        let n = args[0].expect_i64()?;
        recorder.lock().push(n);
        Ok(Value::from(n + 1))
    });

    let result = client
        .get_proxy_function("call_twice")
        .unwrap()
        .call(vec![Value::from(increment), Value::from(1)])
        .unwrap();

    assert_eq!(result, Value::from(3));
    assert_eq!(*seen.lock(), vec![1, 2]);
    // The host dropped its proxy when the call returned.
    assert_eq!(client.host_entry_count(), 0);
    assert_eq!(host.live_proxy_count(), 0);
}

#[test]
fn test_listener_identity_survives_round_trips() {
    let (host, client) = connect(ChannelMode::SyncOnly);
    let listeners: Arc<Mutex<Vec<Function>>> = Arc::new(Mutex::new(Vec::new()));
    let (add, remove, fire) = (listeners.clone(), listeners.clone(), listeners);
    let emitter = Object::builder()
        .method("add_listener", move |_, args| {
            add.lock().push(args[0].expect_function()?.clone());
            Ok(Value::Null)
        })
        .method("remove_listener", move |_, args| {
            let target = args[0].expect_function()?;
            remove.lock().retain(|l| !l.ptr_eq(target));
            Ok(Value::Null)
        })
        .method("fire", move |_, args| {
            let current = fire.lock().clone();
            for listener in &current {
                listener.call(vec![args[0].clone()])?;
            }
            Ok(Value::from(current.len() as i64))
        })
        .build();
    let listener_arg = ArgumentDescriptor::any(FunctionDescriptor::new("listener").returns(Returns::Void));
    host.register_host_object(
        "emitter",
        emitter,
        ObjectDescriptor::new()
            .function(sync_fn("add_listener").argument(listener_arg.clone()))
            .function(sync_fn("remove_listener").argument(listener_arg))
            .function(sync_fn("fire")),
    );
    client.request_remote_descriptors().unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let (log_a, log_b) = (log.clone(), log.clone());
    let a = Function::native("a", move |_, args| {
        log_a.lock().push(format!("a{}", args[0].expect_i64()?));
        Ok(Value::Null)
    });
    let b = Function::native("b", move |_, args| {
        log_b.lock().push(format!("b{}", args[0].expect_i64()?));
        Ok(Value::Null)
    });

    let proxy = client.get_proxy_object("emitter").unwrap();
    proxy.call_method("add_listener", vec![Value::from(a.clone())]).unwrap();
    proxy.call_method("add_listener", vec![Value::from(b.clone())]).unwrap();
    assert_eq!(client.host_entry_count(), 2);

    assert_eq!(proxy.call_method("fire", vec![Value::from(1)]).unwrap(), Value::from(2));
    proxy.call_method("remove_listener", vec![Value::from(a)]).unwrap();
    assert_eq!(proxy.call_method("fire", vec![Value::from(2)]).unwrap(), Value::from(1));

    assert_eq!(*log.lock(), vec!["a1", "b1", "b2"]);
    // Removing the last host reference to `a` released it on the client.
    assert_eq!(client.host_entry_count(), 1);
}

#[test]
fn test_proxy_sent_back_unwraps_to_original() {
    let (host, client) = connect(ChannelMode::SyncOnly);
    host.register_host_function(
        "identity",
        Function::native("identity", |_, mut args| Ok(args.remove(0))),
        sync_fn("identity"),
    );
    client.request_remote_descriptors().unwrap();

    let identity = client.get_proxy_function("identity").unwrap();
    let original = Function::native("original", |_, _| Ok(Value::from("here")));
    let returned = identity.call(vec![Value::from(original.clone())]).unwrap();

    let returned = returned.expect_function().unwrap();
    assert!(returned.ptr_eq(&original));
    assert!(!returned.is_proxy());

    // The host holds its proxy until the client talks to it again.
    assert_eq!(client.host_entry_count(), 1);
    identity.call(vec![Value::from(1)]).unwrap();
    assert_eq!(client.host_entry_count(), 0);
    assert_eq!(host.live_proxy_count(), 0);
}

#[test]
fn test_proxy_passed_back_is_released_after_drop() {
    let (host, client) = connect(ChannelMode::SyncOnly);
    let target = Function::native("target", |_, _| Ok(Value::from("hit")));
    host.register_host_function(
        "make",
        Function::native("make", move |_, _| Ok(Value::from(target.clone()))),
        sync_fn("make"),
    );
    host.register_host_function(
        "identity",
        Function::native("identity", |_, mut args| Ok(args.remove(0))),
        sync_fn("identity"),
    );
    client.request_remote_descriptors().unwrap();

    let made = client
        .get_proxy_function("make")
        .unwrap()
        .call(vec![])
        .unwrap()
        .expect_function()
        .unwrap()
        .clone();
    let identity = client.get_proxy_function("identity").unwrap();
    for _ in 0..3 {
        let back = identity.call(vec![Value::from(made.clone())]).unwrap();
        assert!(back.expect_function().unwrap().ptr_eq(&made));
    }
    assert_eq!(host.host_entry_count(), 3);
    assert_eq!(client.live_proxy_count(), 1);

    drop(made);
    assert_eq!(client.live_proxy_count(), 0);
    assert_eq!(host.host_entry_count(), 2);
}

#[test]
fn test_void_failure_is_silent() {
    let (host, client) = connect(ChannelMode::SyncOnly);
    host.register_host_function(
        "explode",
        Function::native("explode", |_, _| Err(TetherError::failed("nobody hears this"))),
        FunctionDescriptor::new("explode").returns(Returns::Void),
    );
    client.request_remote_descriptors().unwrap();

    let result = client.get_proxy_function("explode").unwrap().call(vec![]);
    assert_eq!(result.unwrap(), Value::Null);
}

// ============================================================================
// Classes and disposal
// ============================================================================

#[test]
fn test_class_instances_share_prototype() {
    let (host, client) = connect(ChannelMode::SyncOnly);
    let (class, descriptor) = counter_class();
    host.register_host_class(class, descriptor);
    client.request_remote_descriptors().unwrap();

    let counter = client.get_proxy_class("Counter").unwrap();
    assert!(counter.has_method("increment"));
    let a = construct(&counter, "first");
    let b = construct(&counter, "second");

    assert!(a.class().unwrap().ptr_eq(&counter));
    assert!(b.class().unwrap().ptr_eq(&counter));
    assert_eq!(a.get("label").unwrap(), Value::from("first"));
    assert_eq!(b.get("label").unwrap(), Value::from("second"));
    assert!(matches!(
        a.set("label", Value::from("renamed")),
        Err(TetherError::Readonly { .. })
    ));

    assert_eq!(a.call_method("increment", vec![]).unwrap(), Value::from(1));
    assert_eq!(a.get("value").unwrap(), Value::from(1));
    assert_eq!(b.get("value").unwrap(), Value::from(0));

    a.set("value", Value::from(10)).unwrap();
    let bound = a.get("increment").unwrap();
    assert_eq!(bound.expect_function().unwrap().call(vec![]).unwrap(), Value::from(11));
}

#[test]
fn test_readonly_proxied_property_is_rejected_by_proxy() {
    let (host, client) = connect(ChannelMode::SyncOnly);
    let writes = Arc::new(AtomicUsize::new(0));
    let seen = writes.clone();
    let gauge = Object::builder()
        .field("level", 3)
        .method("bump", move |this, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            let this = this_object(this)?;
            let next = this.get("level")?.expect_i64()? + 1;
            this.set("level", Value::from(next))?;
            Ok(Value::from(next))
        })
        .build();
    host.register_host_object(
        "gauge",
        gauge,
        ObjectDescriptor::new()
            .function(sync_fn("bump"))
            .proxied_property(PropertyDescriptor::new("level").readonly()),
    );
    client.request_remote_descriptors().unwrap();

    let proxy = client.get_proxy_object("gauge").unwrap();
    assert_eq!(proxy.get("level").unwrap(), Value::from(3));
    let err = proxy.set("level", Value::from(99)).unwrap_err();
    assert!(matches!(err, TetherError::Readonly { ref name } if name == "level"));

    // The value is still read live from the host.
    proxy.call_method("bump", vec![]).unwrap();
    assert_eq!(proxy.get("level").unwrap(), Value::from(4));
    assert_eq!(writes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_disposal_releases_host_entries_once() {
    let (host, client) = connect(ChannelMode::SyncOnly);
    let (class, descriptor) = counter_class();
    host.register_host_class(class, descriptor);
    client.request_remote_descriptors().unwrap();
    let counter = client.get_proxy_class("Counter").unwrap();
    assert_eq!(host.host_entry_count(), 1);

    let a = construct(&counter, "a");
    let b = construct(&counter, "b");
    assert_eq!(host.host_entry_count(), 3);
    assert_eq!(client.live_proxy_count(), 2);

    let a_clone = a.clone();
    drop(a);
    assert_eq!(host.host_entry_count(), 3);
    drop(a_clone);
    assert_eq!(host.host_entry_count(), 2);

    assert!(b.dispose());
    assert_eq!(host.host_entry_count(), 1);
    assert!(!b.dispose());
    assert!(b.is_disposed());
    let err = b.call_method("increment", vec![]).unwrap_err();
    assert!(err.is_disposed());
    drop(b);
    assert_eq!(host.host_entry_count(), 1);
    assert_eq!(client.live_proxy_count(), 0);
}

#[test]
fn test_returned_function_can_be_disposed() {
    let (host, client) = connect(ChannelMode::SyncOnly);
    let make_adder = Function::native("make_adder", |_, args| {
        let n = args[0].expect_i64()?;
        Ok(Value::from(Function::native("adder", move |_, args| {
            Ok(Value::from(args[0].expect_i64()? + n))
        })))
    });
    host.register_host_function("make_adder", make_adder, sync_fn("make_adder"));
    client.request_remote_descriptors().unwrap();

    let adder = client
        .get_proxy_function("make_adder")
        .unwrap()
        .call(vec![Value::from(5)])
        .unwrap();
    let adder = adder.expect_function().unwrap().clone();
    assert_eq!(host.host_entry_count(), 2);

    // Undescribed functions default to async; over a sync channel the call
    // runs inline and comes back as a settled promise.
    let result = adder.call(vec![Value::from(3)]).unwrap();
    let promise = result.as_promise().unwrap();
    assert_eq!(promise.outcome().unwrap().unwrap(), Value::from(8));

    assert!(adder.dispose());
    assert_eq!(host.host_entry_count(), 1);
    assert!(adder.call(vec![Value::from(3)]).unwrap_err().is_disposed());
}

// ============================================================================
// Async and degraded calls
// ============================================================================

#[test]
fn test_async_declared_call_over_sync_channel() {
    let (host, client) = connect(ChannelMode::SyncOnly);
    host.register_host_function(
        "answer",
        Function::native("answer", |_, _| Ok(Value::from(Deferred::resolved(Value::from(42))))),
        FunctionDescriptor::new("answer").returns(Returns::Async),
    );
    client.request_remote_descriptors().unwrap();

    let result = client.get_proxy_function("answer").unwrap().call(vec![]).unwrap();
    let promise = result.as_promise().unwrap();
    assert_eq!(promise.outcome().unwrap().unwrap(), Value::from(42));
    assert_eq!(client.pending_call_count(), 0);
    // The promise entry is released once settled.
    assert_eq!(host.host_entry_count(), 1);
}

#[tokio::test]
async fn test_sync_declared_call_over_async_channel() {
    let (host, client) = connect(ChannelMode::AsyncOnly);
    let (calc, descriptor) = calculator(Arc::new(AtomicUsize::new(0)));
    host.register_host_object("calc", calc, descriptor);

    client.request_remote_descriptors().unwrap().await.unwrap();
    let proxy = client.get_proxy_object("calc").unwrap();
    let result = proxy
        .call_method("add", vec![Value::from(2), Value::from(3)])
        .unwrap();

    assert!(result.as_promise().is_some());
    assert_eq!(result.settle().await.unwrap(), Value::from(5));
    assert_eq!(client.pending_call_count(), 0);
}

#[tokio::test]
async fn test_async_rejection_after_delay() {
    let (host, client) = connect(ChannelMode::AsyncOnly);
    host.register_host_function(
        "slow_fail",
        Function::native("slow_fail", |_, _| {
            let deferred = Deferred::new();
            let settle = deferred.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                settle.reject(TetherError::failed("timed out"));
            });
            Ok(Value::from(deferred))
        }),
        FunctionDescriptor::new("slow_fail").returns(Returns::Async),
    );

    client.request_remote_descriptors().unwrap().await.unwrap();
    let result = client.get_proxy_function("slow_fail").unwrap().call(vec![]).unwrap();
    let err = result.settle().await.unwrap_err();

    assert_eq!(err.to_string(), "timed out");
    assert_eq!(client.pending_call_count(), 0);
}

#[tokio::test]
async fn test_async_channel_class_round_trip() {
    let (host, client) = connect(ChannelMode::AsyncOnly);
    let (class, descriptor) = counter_class();
    host.register_host_class(class, descriptor);
    client.request_remote_descriptors().unwrap().await.unwrap();
    assert!(client.remote_descriptors().classes.contains_key("Counter"));

    let counter = client.get_proxy_class("Counter").unwrap();
    let instance = counter
        .construct(vec![Value::from("net")])
        .unwrap()
        .settle()
        .await
        .unwrap();
    let instance = instance.expect_object().unwrap();

    assert_eq!(instance.get("label").unwrap(), Value::from("net"));
    let next = instance.call_method("increment", vec![]).unwrap().settle().await.unwrap();
    assert_eq!(next, Value::from(1));
}

// ============================================================================
// TCP
// ============================================================================

async fn tcp_host() -> (Arc<TcpChannelServer>, RpcService) {
    let server = Arc::new(
        TcpChannelServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap(),
    );
    let host = RpcService::builder(server.clone())
        .id_generator(SequentialIds::new("host-"))
        .build()
        .unwrap();
    (server, host)
}

async fn tcp_client(server: &TcpChannelServer, prefix: &str) -> RpcService {
    let channel = TcpChannel::connect(server.local_addr()).await.unwrap();
    RpcService::builder(Arc::new(channel))
        .id_generator(SequentialIds::new(prefix))
        .build()
        .unwrap()
}

/// A host object whose `shared` method hands every caller the same
/// `Counter` instance.
fn hub(host: &RpcService) {
    let (class, descriptor) = counter_class();
    host.register_host_class(class.clone(), descriptor);
    let shared = construct(&class, "shared");
    let hub = Object::builder()
        .method("shared", move |_, _| Ok(Value::from(shared.clone())))
        .method("ping", |_, _| Ok(Value::Null))
        .method("greet_via", |_, args| {
            let api = args[0].expect_object()?;
            api.call_method("greet", vec![Value::from("host")])
        })
        .build();
    host.register_host_object(
        "hub",
        hub,
        ObjectDescriptor::new()
            .function(sync_fn("shared"))
            .function(sync_fn("ping"))
            .function(sync_fn("greet_via")),
    );
}

async fn call_hub(client: &RpcService, method: &str, args: Vec<Value>) -> Value {
    let hub = client.get_proxy_object("hub").unwrap();
    hub.call_method(method, args).unwrap().settle().await.unwrap()
}

#[tokio::test]
async fn test_tcp_end_to_end() {
    let (server, host) = tcp_host().await;

    let ticker = Object::builder()
        .method("add", |_, args| {
            Ok(Value::from(args[0].expect_i64()? + args[1].expect_i64()?))
        })
        .method("on_tick", |_, args| {
            let callback = args[0].expect_function()?;
            for i in 1..=2 {
                callback.call(vec![Value::from(i)])?;
            }
            Ok(Value::Null)
        })
        .build();
    host.register_host_object(
        "calc",
        ticker,
        ObjectDescriptor::new().function(sync_fn("add")).function(
            sync_fn("on_tick").argument(ArgumentDescriptor::any(
                FunctionDescriptor::new("tick").returns(Returns::Void),
            )),
        ),
    );

    let client = tcp_client(&server, "client-").await;
    client.request_remote_descriptors().unwrap().await.unwrap();

    let calc = client.get_proxy_object("calc").unwrap();
    let sum = calc
        .call_method("add", vec![Value::from(20), Value::from(22)])
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert_eq!(sum, Value::from(42));

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let tick = Function::native("tick", move |_, args| {
        let _ = tx.send(args[0].expect_i64()?);
        Ok(Value::Null)
    });
    calc.call_method("on_tick", vec![Value::from(tick)])
        .unwrap()
        .settle()
        .await
        .unwrap();

    assert_eq!(rx.recv().await, Some(1));
    assert_eq!(rx.recv().await, Some(2));
    assert_eq!(server.active_connections(), 1);
    server.shutdown();
}

#[tokio::test]
async fn test_tcp_clients_hold_shared_instance_independently() {
    let (server, host) = tcp_host().await;
    hub(&host);
    let exposed = host.host_entry_count();

    let first = tcp_client(&server, "first-").await;
    let second = tcp_client(&server, "second-").await;
    first.request_remote_descriptors().unwrap().await.unwrap();
    second.request_remote_descriptors().unwrap().await.unwrap();

    let from_first = call_hub(&first, "shared", vec![]).await;
    let from_first = from_first.expect_object().unwrap().clone();
    let from_second = call_hub(&second, "shared", vec![]).await;
    let from_second = from_second.expect_object().unwrap().clone();
    assert_eq!(from_first.remote_id(), from_second.remote_id());
    assert_eq!(host.host_entry_count(), exposed + 1);

    // Each connection is handled in order, so once `ping` answers the
    // host has seen the `obj_died` sent before it.
    assert!(from_first.dispose());
    call_hub(&first, "ping", vec![]).await;
    assert_eq!(host.host_entry_count(), exposed + 1);

    let next = from_second
        .call_method("increment", vec![])
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert_eq!(next, Value::from(1));

    assert!(from_second.dispose());
    call_hub(&second, "ping", vec![]).await;
    assert_eq!(host.host_entry_count(), exposed);
    server.shutdown();
}

#[tokio::test]
async fn test_tcp_server_calls_client_exposed_object() {
    let (server, host) = tcp_host().await;
    hub(&host);

    let client = tcp_client(&server, "client-").await;
    let api = Object::builder()
        .method("greet", |_, args| {
            Ok(Value::from(format!("hello {}", args[0].expect_str()?)))
        })
        .build();
    client.register_host_object(
        "client_api",
        api.clone(),
        ObjectDescriptor::new().function(sync_fn("greet")),
    );
    client.send_remote_descriptors(None).unwrap();
    client.request_remote_descriptors().unwrap().await.unwrap();

    let greeting = call_hub(&client, "greet_via", vec![Value::from(api)]).await;
    assert_eq!(greeting, Value::from("hello host"));
    server.shutdown();
}
