//! External-event pump: asynchronously posted platform notifications
//! (device hot-plug, charging, pause/resume) are queued here and drained
//! into the state machine by a dedicated worker, decoupling external
//! producers from the stream's critical sections while keeping FIFO order.

use crossbeam_channel as cb;
use tracing::debug;

use crate::event::Event;

pub(crate) enum PumpMsg {
    Event(Event),
    Exit,
}

/// Producer half of the pump queue.
pub(crate) struct EventPump {
    tx: cb::Sender<PumpMsg>,
}

impl EventPump {
    pub fn new() -> (Self, cb::Receiver<PumpMsg>) {
        let (tx, rx) = cb::unbounded();
        (EventPump { tx }, rx)
    }

    pub fn post(&self, event: Event) {
        debug!(event = event.name(), "external event queued");
        let _ = self.tx.send(PumpMsg::Event(event));
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(PumpMsg::Exit);
    }
}

/// Worker loop. Each wakeup drains the whole backlog into one call of
/// `handle`, which dispatches the batch to the current state under the
/// stream lock.
pub(crate) fn run_pump(rx: cb::Receiver<PumpMsg>, mut handle: impl FnMut(Vec<Event>)) {
    while let Ok(msg) = rx.recv() {
        let mut batch = Vec::new();
        let mut exit = false;
        match msg {
            PumpMsg::Exit => break,
            PumpMsg::Event(ev) => batch.push(ev),
        }
        while let Ok(more) = rx.try_recv() {
            match more {
                PumpMsg::Exit => {
                    exit = true;
                    break;
                }
                PumpMsg::Event(ev) => batch.push(ev),
            }
        }
        handle(batch);
        if exit {
            break;
        }
    }
    debug!("event pump exiting");
}
