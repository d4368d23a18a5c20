//! Worker side of the IPC protocol.
//!
//! A worker process hosts exactly one module. It reads the `setup` message,
//! instantiates the module from a [`ModuleCatalog`], reports the module's
//! action names, then answers calls in arrival order until its input closes.

use std::any::Any;
use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde_json::Value;
use tracing::{info, warn};

use crate::protocol::{self, HostMessage, WorkerMessage};
use crate::types::Kwargs;

/// A loadable module of actions.
pub trait ActionProvider: Send {
    /// Runs once before any call, with the context supplied by the host.
    fn setup(&mut self, _context: &Value) -> Result<(), String> {
        Ok(())
    }

    /// Qualified names of the actions this module serves.
    fn actions(&self) -> Vec<String>;

    fn call(&self, action: &str, args: &[Value], kwargs: &Kwargs) -> Result<Value, String>;
}

type ProviderFactory = Box<dyn Fn() -> Box<dyn ActionProvider> + Send + Sync>;

/// Module name → provider factory.
#[derive(Default)]
pub struct ModuleCatalog {
    factories: BTreeMap<String, ProviderFactory>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, module: &str, factory: F)
    where
        F: Fn() -> Box<dyn ActionProvider> + Send + Sync + 'static,
    {
        self.factories.insert(module.to_string(), Box::new(factory));
    }

    pub fn modules(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn instantiate(&self, module: &str) -> Option<Box<dyn ActionProvider>> {
        self.factories.get(module).map(|factory| factory())
    }
}

/// Run the worker loop for `module` over the given streams.
///
/// Returns when `input` reaches EOF. Action failures and panics are
/// answered as error replies; only IO errors end the loop early.
pub fn serve<R: BufRead, W: Write>(
    catalog: &ModuleCatalog,
    module: &str,
    input: R,
    mut output: W,
) -> io::Result<()> {
    let mut lines = input.lines();

    let context = loop {
        let Some(line) = lines.next() else {
            return Ok(());
        };
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match protocol::decode::<HostMessage>(&line) {
            Ok(HostMessage::Setup {
                module: requested,
                context,
            }) => {
                if requested != module {
                    warn!("Setup names module {} but worker hosts {}", requested, module);
                }
                break context;
            }
            Ok(other) => warn!("Ignoring {:?} before setup", other),
            Err(e) => warn!("{}", e),
        }
    };

    let Some(mut provider) = catalog.instantiate(module) else {
        send(
            &mut output,
            &WorkerMessage::SetupFailed {
                error: format!("unknown module: {}", module),
            },
        )?;
        return Ok(());
    };

    if let Err(error) = contain(catch_unwind(AssertUnwindSafe(|| provider.setup(&context)))) {
        warn!("Setup of {} failed: {}", module, error);
        send(&mut output, &WorkerMessage::SetupFailed { error })?;
        return Ok(());
    }

    send(
        &mut output,
        &WorkerMessage::Ready {
            actions: provider.actions(),
        },
    )?;
    info!("Module {} ready", module);

    for line in lines {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match protocol::decode::<HostMessage>(&line) {
            Ok(HostMessage::Call {
                id,
                name,
                args,
                kwargs,
            }) => {
                let outcome =
                    contain(catch_unwind(AssertUnwindSafe(|| provider.call(&name, &args, &kwargs))));
                let reply = match outcome {
                    Ok(result) => WorkerMessage::Reply {
                        id,
                        result,
                        error: None,
                    },
                    Err(error) => WorkerMessage::Reply {
                        id,
                        result: Value::Null,
                        error: Some(error),
                    },
                };
                send(&mut output, &reply)?;
            }
            Ok(HostMessage::Setup { .. }) => warn!("Duplicate setup ignored"),
            Err(e) => warn!("Dropping malformed request: {}", e),
        }
    }

    info!("Input closed, worker for {} exiting", module);
    Ok(())
}

/// [`serve`] over the process's stdin and stdout.
pub fn serve_stdio(catalog: &ModuleCatalog, module: &str) -> io::Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    serve(catalog, module, stdin.lock(), stdout.lock())
}

fn send<W: Write>(output: &mut W, message: &WorkerMessage) -> io::Result<()> {
    let line = protocol::encode(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    output.write_all(line.as_bytes())?;
    output.flush()
}

fn contain<T>(outcome: std::thread::Result<Result<T, String>>) -> Result<T, String> {
    match outcome {
        Ok(result) => result,
        Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    struct Echo {
        prefix: String,
    }

    impl ActionProvider for Echo {
        fn setup(&mut self, context: &Value) -> Result<(), String> {
            if context.get("fail").is_some() {
                return Err("refused".into());
            }
            if let Some(p) = context.get("prefix").and_then(Value::as_str) {
                self.prefix = p.to_string();
            }
            Ok(())
        }

        fn actions(&self) -> Vec<String> {
            vec!["echo.say".into(), "echo.panic".into()]
        }

        fn call(&self, action: &str, args: &[Value], _kwargs: &Kwargs) -> Result<Value, String> {
            match action {
                "echo.say" => Ok(json!(format!(
                    "{}{}",
                    self.prefix,
                    args.first().and_then(Value::as_str).unwrap_or("")
                ))),
                "echo.panic" => panic!("kaboom"),
                other => Err(format!("no such action: {}", other)),
            }
        }
    }

    fn catalog() -> ModuleCatalog {
        let mut catalog = ModuleCatalog::new();
        catalog.register("test.echo", || {
            Box::new(Echo {
                prefix: String::new(),
            })
        });
        catalog
    }

    fn run(module: &str, input: &str) -> Vec<WorkerMessage> {
        let mut output = Vec::new();
        serve(&catalog(), module, Cursor::new(input.as_bytes()), &mut output).unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| protocol::decode(l).unwrap())
            .collect()
    }

    #[test]
    fn test_setup_and_calls() {
        let input = concat!(
            r#"{"type":"setup","module":"test.echo","context":{"prefix":">"}}"#, "\n",
            r#"{"type":"call","id":1,"name":"echo.say","args":["hi"]}"#, "\n",
            r#"{"type":"call","id":2,"name":"echo.missing"}"#, "\n",
        );
        let messages = run("test.echo", input);
        assert_eq!(messages.len(), 3);
        assert_eq!(
            messages[0],
            WorkerMessage::Ready {
                actions: vec!["echo.say".into(), "echo.panic".into()]
            }
        );
        assert_eq!(
            messages[1],
            WorkerMessage::Reply {
                id: 1,
                result: json!(">hi"),
                error: None
            }
        );
        assert!(matches!(
            &messages[2],
            WorkerMessage::Reply { id: 2, error: Some(e), .. } if e.contains("echo.missing")
        ));
    }

    #[test]
    fn test_panic_becomes_error_reply() {
        let input = concat!(
            r#"{"type":"setup","module":"test.echo"}"#, "\n",
            r#"{"type":"call","id":5,"name":"echo.panic"}"#, "\n",
            r#"{"type":"call","id":6,"name":"echo.say","args":["still here"]}"#, "\n",
        );
        let messages = run("test.echo", input);
        assert!(matches!(
            &messages[1],
            WorkerMessage::Reply { id: 5, error: Some(e), .. } if e.contains("kaboom")
        ));
        assert!(matches!(&messages[2], WorkerMessage::Reply { id: 6, error: None, .. }));
    }

    #[test]
    fn test_setup_failure() {
        let input = r#"{"type":"setup","module":"test.echo","context":{"fail":true}}"#;
        let messages = run("test.echo", input);
        assert_eq!(
            messages,
            vec![WorkerMessage::SetupFailed {
                error: "refused".into()
            }]
        );
    }

    #[test]
    fn test_unknown_module() {
        let input = r#"{"type":"setup","module":"nope"}"#;
        let messages = run("nope", input);
        assert!(matches!(&messages[0], WorkerMessage::SetupFailed { .. }));
    }

    #[test]
    fn test_eof_before_setup() {
        assert!(run("test.echo", "").is_empty());
    }
}
