//! In-memory runtime double for tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use tether_platform::{CredentialProvider, Secret, SecretError};

use crate::runtime::{AgentRuntime, InboundMessage, SessionSeed};
use crate::RuntimeError;

/// Credential provider backed by a fixed map.
#[derive(Default)]
pub struct StaticProvider {
    secrets: HashMap<String, String>,
}

impl StaticProvider {
    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.secrets.insert(name.to_string(), value.to_string());
        self
    }
}

#[async_trait]
impl CredentialProvider for StaticProvider {
    async fn resolve(&self, name: &str) -> Result<Secret, SecretError> {
        self.secrets
            .get(name)
            .map(Secret::new)
            .ok_or_else(|| SecretError::NotFound(name.to_string()))
    }
}

/// Records every call and returns configurable responses.
#[derive(Default)]
pub struct MockRuntime {
    pub injected: Mutex<Vec<(String, InboundMessage)>>,
    pub commands: Mutex<Vec<(String, String, Vec<String>)>>,
    pub created: Mutex<Vec<(String, SessionSeed)>>,
    pub destroyed: Mutex<Vec<String>>,
    command_outputs: Mutex<HashMap<String, String>>,
    command_errors: Mutex<HashMap<String, String>>,
    fail_injections: AtomicU32,
    inject_delay: Mutex<Option<Duration>>,
}

impl MockRuntime {
    /// Fixed output for a named command (default echoes the name).
    pub fn set_command_output(&self, name: &str, output: &str) {
        self.command_outputs
            .lock()
            .unwrap()
            .insert(name.to_string(), output.to_string());
    }

    /// Make a named command fail.
    pub fn set_command_error(&self, name: &str, message: &str) {
        self.command_errors
            .lock()
            .unwrap()
            .insert(name.to_string(), message.to_string());
    }

    /// Fail the next `n` injections with `Unavailable`.
    pub fn fail_next_injections(&self, n: u32) {
        self.fail_injections.store(n, Ordering::SeqCst);
    }

    /// Delay every injection (for timeout tests).
    pub fn set_inject_delay(&self, delay: Duration) {
        *self.inject_delay.lock().unwrap() = Some(delay);
    }

    pub fn injected_count(&self) -> usize {
        self.injected.lock().unwrap().len()
    }

    pub fn created_keys(&self) -> Vec<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }
}

#[async_trait]
impl AgentRuntime for MockRuntime {
    async fn create_session(
        &self,
        session_key: &str,
        seed: &SessionSeed,
    ) -> Result<(), RuntimeError> {
        self.created
            .lock()
            .unwrap()
            .push((session_key.to_string(), seed.clone()));
        Ok(())
    }

    async fn destroy_session(&self, session_key: &str) -> Result<(), RuntimeError> {
        self.destroyed.lock().unwrap().push(session_key.to_string());
        Ok(())
    }

    async fn inject_message(
        &self,
        session_key: &str,
        message: &InboundMessage,
    ) -> Result<(), RuntimeError> {
        let delay = *self.inject_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let remaining = self.fail_injections.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_injections.store(remaining - 1, Ordering::SeqCst);
            return Err(RuntimeError::Unavailable("mock runtime down".into()));
        }

        self.injected
            .lock()
            .unwrap()
            .push((session_key.to_string(), message.clone()));
        Ok(())
    }

    async fn execute_command(
        &self,
        session_key: &str,
        name: &str,
        args: &[String],
    ) -> Result<String, RuntimeError> {
        self.commands.lock().unwrap().push((
            session_key.to_string(),
            name.to_string(),
            args.to_vec(),
        ));

        if let Some(message) = self.command_errors.lock().unwrap().get(name) {
            return Err(RuntimeError::Command(message.clone()));
        }

        let outputs = self.command_outputs.lock().unwrap();
        Ok(outputs
            .get(name)
            .cloned()
            .unwrap_or_else(|| format!("{name}: done")))
    }
}
