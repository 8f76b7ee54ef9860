//! Demo objects exposed by `tether-rpc serve`.

use std::time::Duration;
use tether_core::{
    this_object, ArgumentDescriptor, Class, ClassDescriptor, Deferred, FunctionDescriptor,
    Object, ObjectDescriptor, PropertyDescriptor, Returns, RpcService, TetherError, Value,
};
use tracing::debug;

/// Delay before `delayed_square` settles.
const SQUARE_DELAY: Duration = Duration::from_millis(50);

fn sync_fn(name: &str) -> FunctionDescriptor {
    FunctionDescriptor::new(name).returns(Returns::Sync)
}

pub fn calculator() -> (Object, ObjectDescriptor) {
    let object = Object::builder()
        .field("version", env!("CARGO_PKG_VERSION"))
        .method("add", |_, args| {
            Value::finite(arg_f64(&args, 0)? + arg_f64(&args, 1)?)
        })
        .method("divide", |_, args| {
            let divisor = arg_f64(&args, 1)?;
            if divisor == 0.0 {
                return Err(TetherError::failed("Division by zero"));
            }
            Value::finite(arg_f64(&args, 0)? / divisor)
        })
        .method("delayed_square", |_, args| {
            let n = arg_f64(&args, 0)?;
            let runtime = tokio::runtime::Handle::try_current()
                .map_err(|_| TetherError::failed("delayed_square needs a tokio runtime"))?;
            let deferred = Deferred::new();
            let settle = deferred.clone();
            runtime.spawn(async move {
                tokio::time::sleep(SQUARE_DELAY).await;
                settle.settle(Value::finite(n * n));
            });
            Ok(Value::from(deferred))
        })
        .method("on_tick", |_, args| {
            let callback = args
                .first()
                .ok_or_else(|| TetherError::failed("on_tick expects a callback"))?
                .expect_function()?;
            let count = args.get(1).and_then(Value::as_i64).unwrap_or(3);
            for tick in 1..=count {
                callback.call(vec![Value::from(tick)])?;
            }
            debug!("Delivered {} ticks", count);
            Ok(Value::from(count))
        })
        .build();

    let descriptor = ObjectDescriptor::new()
        .function(sync_fn("add"))
        .function(sync_fn("divide"))
        .function(FunctionDescriptor::new("delayed_square").returns(Returns::Async))
        .function(sync_fn("on_tick").argument(ArgumentDescriptor::at(
            0,
            FunctionDescriptor::new("tick").returns(Returns::Void),
        )))
        .readonly_property("version");
    (object, descriptor)
}

pub fn counter_class() -> (Class, ClassDescriptor) {
    let class = Class::builder("Counter")
        .constructor(|class, args| {
            let label = args
                .into_iter()
                .next()
                .filter(|v| !v.is_null())
                .unwrap_or_else(|| Value::from("counter"));
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

/// Expose the calculator and the `Counter` class on `service`.
pub fn register(service: &RpcService) {
    let (calculator, descriptor) = calculator();
    service.register_host_object("calculator", calculator, descriptor);
    let (counter, descriptor) = counter_class();
    service.register_host_class(counter, descriptor);
}

fn arg_f64(args: &[Value], idx: usize) -> tether_core::Result<f64> {
    args.get(idx)
        .ok_or_else(|| TetherError::failed(format!("missing argument {}", idx)))?
        .expect_f64()
}
