//! Units shipped with the stock runtime process
//!
//! Embedders link `palisade-daemon` as a library and serve their own
//! [`ParentDomain`]; the `palisade-worker` binary serves this one.

use palisade_core::{
    Argument, HostDomain, PalisadeError, ParentDomain, Result, SandboxedUnit, UnitDefinition, UnitEnv, Value,
};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Returns its first argument.
struct Echo(Value);

impl SandboxedUnit for Echo {
    fn execute(&mut self, _env: &mut UnitEnv<'_>) -> Result<Value> {
        Ok(self.0.clone())
    }
}

/// Adds up its numeric arguments.
struct Sum(Vec<f64>);

impl SandboxedUnit for Sum {
    fn execute(&mut self, _env: &mut UnitEnv<'_>) -> Result<Value> {
        Ok(json!(self.0.iter().sum::<f64>()))
    }
}

/// Burns CPU for the given number of milliseconds, optionally inside a
/// critical section.
struct Spin {
    millis: u64,
    critical: bool,
}

impl SandboxedUnit for Spin {
    fn execute(&mut self, env: &mut UnitEnv<'_>) -> Result<Value> {
        let _section = self.critical.then(|| env.critical_section());
        let deadline = Instant::now() + Duration::from_millis(self.millis);
        let mut rounds: u64 = 0;
        while Instant::now() < deadline {
            rounds = rounds.wrapping_add(1);
            if rounds % 4096 == 0 {
                env.checkpoint()?;
            }
        }
        Ok(json!(rounds))
    }
}

/// Reads a file through the enforcement context.
struct ReadFile(String);

impl SandboxedUnit for ReadFile {
    fn execute(&mut self, env: &mut UnitEnv<'_>) -> Result<Value> {
        let bytes = env.read_file(&self.0)?;
        Ok(json!(String::from_utf8_lossy(&bytes)))
    }
}

/// Calls the unit named by its first argument.
struct Call(String);

impl SandboxedUnit for Call {
    fn execute(&mut self, env: &mut UnitEnv<'_>) -> Result<Value> {
        env.call(&self.0, &[])
    }
}

/// Terminates the whole process.
struct Exit;

impl SandboxedUnit for Exit {
    fn execute(&mut self, _env: &mut UnitEnv<'_>) -> Result<Value> {
        tracing::warn!("demo.Exit terminating the runtime process");
        std::process::exit(3);
    }
}

fn first(args: &[Argument]) -> Value {
    args.first().map_or(Value::Null, |a| a.value().clone())
}

fn text(args: &[Argument], unit: &str) -> Result<String> {
    first(args)
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| PalisadeError::ExecutionFailure {
            unit: unit.to_string(),
            message: "expected a string argument".into(),
        })
}

fn millis(args: &[Argument]) -> u64 {
    first(args).as_u64().unwrap_or(1000)
}

/// The demo parent domain: every unit under `demo.`.
#[must_use]
pub fn domain() -> Arc<dyn ParentDomain> {
    let host = HostDomain::new();
    host.register(UnitDefinition::new("demo.Echo").with_entry(|args: &[Argument]| Ok(Echo(first(args)))))
        .register(UnitDefinition::new("demo.Sum").with_entry(|args: &[Argument]| {
            Ok(Sum(args.iter().filter_map(|a| a.value().as_f64()).collect()))
        }))
        .register(UnitDefinition::new("demo.Spin").with_entry(|args: &[Argument]| {
            Ok(Spin {
                millis: millis(args),
                critical: false,
            })
        }))
        .register(UnitDefinition::new("demo.CriticalSpin").with_entry(|args: &[Argument]| {
            Ok(Spin {
                millis: millis(args),
                critical: true,
            })
        }))
        .register(UnitDefinition::new("demo.ReadFile").with_entry(|args: &[Argument]| {
            text(args, "demo.ReadFile").map(ReadFile)
        }))
        .register(UnitDefinition::new("demo.Call").with_entry(|args: &[Argument]| text(args, "demo.Call").map(Call)))
        .register(UnitDefinition::new("demo.Exit").with_entry(|_: &[Argument]| Ok(Exit)));
    Arc::new(host)
}
