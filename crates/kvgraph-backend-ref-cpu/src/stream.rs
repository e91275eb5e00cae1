//! Single in-order command stream drained by a worker thread.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use kvgraph::backend::{BackendError, BackendResult};
use kvgraph::ops::Op;
use tracing::{trace, warn};

use crate::buffer::CpuBuffer;
use crate::cpu::CpuKernelInterceptor;
use crate::kernels;

pub(crate) enum Command {
    Launch {
        op: Op,
        inputs: Vec<CpuBuffer>,
        outputs: Vec<CpuBuffer>,
    },
    Convert {
        src: CpuBuffer,
        dst: CpuBuffer,
    },
    Fence(Sender<Option<BackendError>>),
}

pub(crate) struct Stream {
    sender: Mutex<Option<Sender<Command>>>,
    worker: Option<JoinHandle<()>>,
}

impl Stream {
    pub(crate) fn spawn<I: CpuKernelInterceptor + 'static>(interceptor: Arc<I>) -> BackendResult<Self> {
        let (sender, receiver) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("kvgraph-ref-cpu".to_string())
            .spawn(move || drain(interceptor.as_ref(), receiver))
            .map_err(|err| BackendError::execution(format!("cannot start stream worker: {err}")))?;
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: Some(worker),
        })
    }

    pub(crate) fn submit(&self, command: Command) -> BackendResult<()> {
        let guard = self
            .sender
            .lock()
            .map_err(|_| BackendError::execution("stream sender is poisoned"))?;
        guard
            .as_ref()
            .ok_or_else(|| BackendError::execution("stream is shut down"))?
            .send(command)
            .map_err(|_| BackendError::execution("stream worker has exited"))
    }

    /// Waits for every command submitted so far; returns the first failure
    /// since the previous fence.
    pub(crate) fn fence(&self) -> BackendResult<()> {
        let (reply, result) = mpsc::channel();
        self.submit(Command::Fence(reply))?;
        match result.recv() {
            Ok(None) => Ok(()),
            Ok(Some(err)) => Err(err),
            Err(_) => Err(BackendError::execution("stream worker exited before the fence")),
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn drain<I: CpuKernelInterceptor>(interceptor: &I, receiver: Receiver<Command>) {
    let mut sticky: Option<BackendError> = None;
    while let Ok(command) = receiver.recv() {
        let result = match command {
            Command::Fence(reply) => {
                let _ = reply.send(sticky.take());
                continue;
            }
            _ if sticky.is_some() => continue,
            Command::Launch {
                op,
                inputs,
                outputs,
            } => {
                trace!(op = op.name(), "launch");
                let outcome = match interceptor.try_execute(&op, &inputs, &outputs) {
                    Some(outcome) => outcome,
                    None => kernels::execute(&op, &inputs, &outputs),
                };
                outcome.map_err(|err| (op.name(), err))
            }
            Command::Convert { src, dst } => dst.copy_from(&src).map_err(|err| ("convert", err)),
        };
        if let Err((what, err)) = result {
            warn!(command = what, error = %err, "stream command failed; discarding queue until next fence");
            sticky = Some(err);
        }
    }
}
