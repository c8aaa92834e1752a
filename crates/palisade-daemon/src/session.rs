//! Request handling inside a runtime process
//!
//! A process serves one client session at a time. `Init` binds the session
//! to a policy; `RunInContext` and `RunSandboxed` then execute under that
//! policy until `Reset` clears it. `Execute` carries its own policy and
//! works without a session.

use palisade_core::protocol::{Request, Response};
use palisade_core::{
    Argument, CodeLoader, CoordinatorConfig, ExecutionCoordinator, PalisadeError, ParentDomain, PolicyHandle,
    Result, RunMode, SandboxedCallResult,
};
use parking_lot::Mutex;
use std::sync::Arc;

pub struct RemoteSession {
    name: String,
    coordinator: ExecutionCoordinator,
    bound: Mutex<Option<CodeLoader>>,
}

impl RemoteSession {
    pub fn new(name: impl Into<String>, domain: Arc<dyn ParentDomain>, config: CoordinatorConfig) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            coordinator: ExecutionCoordinator::new(domain, config)?,
            bound: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn coordinator(&self) -> &ExecutionCoordinator {
        &self.coordinator
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.bound.lock().is_some()
    }

    /// Answer one request. Blocks for as long as the execution runs.
    pub fn handle(&self, request: Request) -> Response {
        let kind = request.kind();
        tracing::debug!(process = %self.name, request = kind, "handling request");
        let outcome = match request {
            Request::Ping => {
                return Response::Pong {
                    name: self.name.clone(),
                };
            }
            Request::Init { policy } => self.init(policy).map(|()| Response::Done),
            Request::Reset => {
                self.reset();
                Ok(Response::Done)
            }
            Request::Execute { task } => self.coordinator.execute_task(&task).map(result),
            Request::RunInContext { unit, args } => self.run(&unit, RunMode::InContext, &args).map(result),
            Request::RunSandboxed { unit, args } => self.run(&unit, RunMode::Sandboxed, &args).map(result),
            Request::RegisterContext { name, policy } => {
                self.coordinator.register_context(&name, policy);
                Ok(Response::Done)
            }
            // The server stops the process once this is acknowledged.
            Request::Shutdown => Ok(Response::Done),
        };
        outcome.unwrap_or_else(|e| {
            tracing::debug!(process = %self.name, request = kind, error = %e, "request failed");
            Response::failure(&e)
        })
    }

    fn init(&self, policy: PolicyHandle) -> Result<()> {
        let mut bound = self.bound.lock();
        if bound.is_some() {
            return Err(PalisadeError::AlreadyInitialized);
        }
        tracing::info!(process = %self.name, policy = policy.name(), "session initialized");
        *bound = Some(self.coordinator.init_loader(&policy));
        Ok(())
    }

    fn reset(&self) {
        if self.bound.lock().take().is_some() {
            tracing::info!(process = %self.name, "session reset");
        }
    }

    fn run(&self, unit: &str, mode: RunMode, args: &[Argument]) -> Result<SandboxedCallResult> {
        let loader = self.bound.lock().clone().ok_or(PalisadeError::NotInitialized)?;
        self.coordinator.run(unit, &loader, mode, args)
    }
}

fn result(result: SandboxedCallResult) -> Response {
    Response::Result { result }
}

impl std::fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession")
            .field("name", &self.name)
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_core::error::FailureKind;
    use palisade_core::{PermissionPolicy, SandboxTask};
    use serde_json::json;

    fn session() -> RemoteSession {
        RemoteSession::new("Nr7", crate::demo::domain(), CoordinatorConfig::remote()).expect("session")
    }

    fn echo_policy() -> PolicyHandle {
        let mut policy = PermissionPolicy::new("echo-only");
        policy.allow_class("demo.Echo");
        policy.freeze()
    }

    fn failure(response: Response) -> FailureKind {
        match response {
            Response::Failure { failure } => failure.kind,
            other => panic!("expected a failure, got {other:?}"),
        }
    }

    #[test]
    fn ping_reports_the_process_name() {
        assert!(matches!(session().handle(Request::Ping), Response::Pong { name } if name == "Nr7"));
    }

    #[test]
    fn runs_need_a_session() {
        let session = session();
        let run = Request::RunSandboxed {
            unit: "demo.Echo".into(),
            args: vec![Argument::new(1)],
        };
        assert_eq!(failure(session.handle(run.clone())), FailureKind::NotInitialized);

        assert!(matches!(session.handle(Request::Init { policy: echo_policy() }), Response::Done));
        assert_eq!(
            failure(session.handle(Request::Init { policy: echo_policy() })),
            FailureKind::AlreadyInitialized
        );
        match session.handle(run.clone()) {
            Response::Result { result } => assert_eq!(result.raw(), &json!(1)),
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(session.handle(Request::Reset), Response::Done));
        assert!(!session.is_initialized());
        assert_eq!(failure(session.handle(run)), FailureKind::NotInitialized);
    }

    #[test]
    fn sandboxed_runs_enforce_the_session_policy() {
        let session = session();
        session.handle(Request::Init { policy: echo_policy() });
        let denied = session.handle(Request::RunSandboxed {
            unit: "demo.Sum".into(),
            args: Vec::new(),
        });
        assert_eq!(failure(denied), FailureKind::AccessDenied);

        let trusted = session.handle(Request::RunInContext {
            unit: "demo.Sum".into(),
            args: vec![Argument::new(2), Argument::new(3)],
        });
        assert!(matches!(trusted, Response::Result { result } if result.raw() == &json!(5.0)));
    }

    #[test]
    fn tasks_carry_their_own_policy() {
        let session = session();
        let task = SandboxTask::new("demo.Echo", echo_policy(), RunMode::Sandboxed, vec![Argument::new("hi")]);
        assert!(matches!(
            session.handle(Request::Execute { task }),
            Response::Result { result } if result.raw() == &json!("hi")
        ));
        assert!(!session.is_initialized());
    }

    #[test]
    fn registered_contexts_reach_the_registry() {
        let session = session();
        let response = session.handle(Request::RegisterContext {
            name: "echo".into(),
            policy: echo_policy(),
        });
        assert!(matches!(response, Response::Done));
        assert_eq!(session.coordinator().context("echo").expect("context").name(), "echo-only");
    }
}
