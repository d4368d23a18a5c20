//! Action modules this binary can host as a worker.

use std::time::Duration;

use conductor_actions::{ActionProvider, Kwargs, ModuleCatalog};
use serde_json::{json, Value};

pub fn catalog() -> ModuleCatalog {
    let mut catalog = ModuleCatalog::new();
    catalog.register("demo.math", || Box::new(MathModule));
    catalog
}

/// Small arithmetic module used for smoke tests and demos.
///
/// Setup context: `setup_delay_ms` delays the ready report,
/// `fail_setup` makes setup fail.
struct MathModule;

impl ActionProvider for MathModule {
    fn setup(&mut self, context: &Value) -> Result<(), String> {
        if let Some(ms) = context.get("setup_delay_ms").and_then(Value::as_u64) {
            std::thread::sleep(Duration::from_millis(ms));
        }
        if context.get("fail_setup").and_then(Value::as_bool) == Some(true) {
            return Err("setup refused by context".into());
        }
        Ok(())
    }

    fn actions(&self) -> Vec<String> {
        ["math.add", "math.echo", "math.slow", "math.fail", "math.pid"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn call(&self, action: &str, args: &[Value], kwargs: &Kwargs) -> Result<Value, String> {
        match action {
            "math.add" => add(args.iter().chain(kwargs.values())),
            "math.echo" => Ok(json!({"args": args, "kwargs": kwargs})),
            "math.slow" => {
                let ms = args
                    .first()
                    .or_else(|| kwargs.get("ms"))
                    .and_then(Value::as_u64)
                    .unwrap_or(100);
                std::thread::sleep(Duration::from_millis(ms));
                Ok(json!(ms))
            }
            "math.fail" => Err(args
                .first()
                .and_then(Value::as_str)
                .unwrap_or("requested failure")
                .to_string()),
            "math.pid" => Ok(json!(std::process::id())),
            other => Err(format!("unknown action: {}", other)),
        }
    }
}

fn add<'a>(values: impl Iterator<Item = &'a Value>) -> Result<Value, String> {
    let mut int_sum: i64 = 0;
    let mut float_sum: f64 = 0.0;
    let mut is_float = false;
    for value in values {
        if let Some(i) = value.as_i64() {
            int_sum += i;
            float_sum += i as f64;
        } else if let Some(f) = value.as_f64() {
            float_sum += f;
            is_float = true;
        } else {
            return Err(format!("not a number: {}", value));
        }
    }
    Ok(if is_float { json!(float_sum) } else { json!(int_sum) })
}
