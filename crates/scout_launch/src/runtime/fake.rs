//! Scripted launcher double for deterministic runtime tests
//!
//! Records every spawn and terminate so tests can assert exact ordering
//! without touching real OS processes.

use crate::runtime::launcher::{SpawnFailure, SpawnRequest, UnitHandle, UnitLauncher};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Scripted behavior for one unit
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Spawn fine and keep running until terminated
    RunForever,
    /// Spawn fine, then exit with the given status on the next poll
    Exit(Option<i32>),
    /// Fail the first n spawn attempts, then run forever
    FailSpawns(u32),
    /// Spawn fine but never signal readiness
    NeverReady,
}

#[derive(Default)]
pub struct FakeLauncher {
    behaviors: Mutex<HashMap<String, Behavior>>,
    attempts: Mutex<HashMap<String, u32>>,
    events: Arc<Mutex<Vec<String>>>,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, name: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(name.to_string(), behavior);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl UnitLauncher for FakeLauncher {
    async fn spawn(&self, request: SpawnRequest) -> Result<Box<dyn UnitHandle>, SpawnFailure> {
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&request.name)
            .cloned()
            .unwrap_or(Behavior::RunForever);
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(request.name.clone()).or_insert(0);
            *n += 1;
            *n
        };

        if let Behavior::FailSpawns(failures) = behavior {
            if attempt <= failures {
                self.events
                    .lock()
                    .unwrap()
                    .push(format!("spawn_fail:{}", request.name));
                return Err(SpawnFailure {
                    name: request.name.clone(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "scripted spawn failure",
                    ),
                });
            }
        }

        self.events
            .lock()
            .unwrap()
            .push(format!("spawn:{}", request.name));

        let exit = match behavior {
            Behavior::Exit(code) => Some(code),
            _ => None,
        };
        Ok(Box::new(FakeHandle {
            name: request.name,
            exit,
            never_ready: matches!(behavior, Behavior::NeverReady),
            events: Arc::clone(&self.events),
        }))
    }
}

struct FakeHandle {
    name: String,
    exit: Option<Option<i32>>,
    never_ready: bool,
    events: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl UnitHandle for FakeHandle {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    async fn ready(&mut self) -> bool {
        if self.never_ready {
            std::future::pending::<()>().await;
        }
        true
    }

    fn try_wait(&mut self) -> Option<Option<i32>> {
        self.exit.take()
    }

    async fn terminate(&mut self, _grace: Duration) -> Option<i32> {
        self.events
            .lock()
            .unwrap()
            .push(format!("terminate:{}", self.name));
        Some(0)
    }
}
