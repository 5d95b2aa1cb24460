//! Control worker thread
//!
//! The orchestrator's unlock and write-verify sequences sleep for seconds at
//! a time, so it lives on its own thread and takes commands from a queue.
//! The poll loop and the user-facing side only enqueue and read the board.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use fb_error::Result;
use tracing::{debug, info, warn};

use super::board::FanBoard;
use super::orchestrator::{ControlMode, FanOrchestrator, FanSpeed};
use crate::clock::Clock;
use crate::smc::SmcAccess;

#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    SetMode(ControlMode),
    SetManual(f64),
    SetFan { index: u32, speed: FanSpeed },
    SetAll(f64),
    AllAuto,
    Reevaluate,
    Shutdown,
}

pub struct ControlWorker {
    tx: Sender<ControlCommand>,
    board: FanBoard,
    handle: Option<JoinHandle<()>>,
}

impl ControlWorker {
    /// Move the orchestrator onto a dedicated thread
    pub fn spawn<A, C>(orchestrator: FanOrchestrator<A, C>) -> Result<Self>
    where
        A: SmcAccess + 'static,
        C: Clock + 'static,
    {
        let board = orchestrator.board();
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("fan-control".into())
            .spawn(move || run(orchestrator, rx))?;

        Ok(Self {
            tx,
            board,
            handle: Some(handle),
        })
    }

    /// Queue a command. False once the worker has stopped.
    pub fn send(&self, command: ControlCommand) -> bool {
        self.tx.send(command).is_ok()
    }

    pub fn board(&self) -> FanBoard {
        self.board.clone()
    }

    /// Reset the fans and wait for the thread to finish
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.tx.send(ControlCommand::Shutdown);
        if handle.join().is_err() {
            warn!("SHUTDOWN: control thread panicked");
        }
    }
}

impl Drop for ControlWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<A: SmcAccess, C: Clock>(mut orchestrator: FanOrchestrator<A, C>, rx: Receiver<ControlCommand>) {
    debug!("control worker started");

    while let Ok(command) = rx.recv() {
        let outcome = match command {
            ControlCommand::SetMode(mode) => orchestrator.set_control_mode(mode).map(|_| true),
            ControlCommand::SetManual(pct) => orchestrator.set_manual_speed(pct),
            ControlCommand::SetFan { index, speed } => orchestrator.set_fan_speed(index, speed),
            ControlCommand::SetAll(pct) => orchestrator.set_all_fans_speed(pct),
            ControlCommand::AllAuto => Ok(orchestrator.set_all_fans_auto()),
            ControlCommand::Reevaluate => Ok(orchestrator.reevaluate()),
            ControlCommand::Shutdown => break,
        };
        match outcome {
            Ok(true) => {}
            Ok(false) => debug!("control command had no effect or did not verify"),
            Err(e) => warn!("control command rejected: {}", e),
        }
    }

    info!("control worker stopping");
    orchestrator.shutdown();
}
