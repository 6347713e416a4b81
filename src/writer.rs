//! Writer: appends collected batches to the in-progress output container.
//!
//! The output file is mutated by this thread only. The writer reports
//! finished once the collector has signalled (by dropping its sender) that
//! no further batches will come and the queue is drained; the runner then
//! reopens the container to finalize attributes.

use std::thread::JoinHandle;

use crossbeam_channel::Receiver;

use crate::error::{ErrorSlot, FpError};
use crate::logging::LogSender;
use crate::model::EventRecord;
use crate::store::DatasetWriter;

/// Flush to disk every this many batches; the close flush covers the rest.
const FLUSH_EVERY_BATCHES: usize = 10;

pub struct WriterThread {
    handle: JoinHandle<()>,
}

impl WriterThread {
    pub fn spawn(
        writer: DatasetWriter,
        batch_rx: Receiver<Vec<EventRecord>>,
        errors: ErrorSlot,
        log: LogSender,
    ) -> std::io::Result<Self> {
        let handle = std::thread::Builder::new()
            .name("writer".to_owned())
            .spawn(move || run_loop(writer, &batch_rx, &errors, &log))?;
        Ok(Self { handle })
    }

    #[must_use]
    pub fn into_handle(self) -> JoinHandle<()> {
        self.handle
    }
}

fn run_loop(
    mut writer: DatasetWriter,
    batch_rx: &Receiver<Vec<EventRecord>>,
    errors: &ErrorSlot,
    log: &LogSender,
) {
    let mut batches = 0usize;
    for batch in batch_rx {
        writer.append_events(&batch);
        batches += 1;
        if batches % FLUSH_EVERY_BATCHES == 0 {
            if let Err(error) = writer.flush() {
                errors.set(FpError::stage("writer", error.to_string()));
                return;
            }
        }
    }
    let events = writer.event_count();
    match writer.close() {
        Ok(()) => log.debug("writer", format!("{events} events on disk, {batches} batches")),
        Err(error) => errors.set(FpError::stage("writer", error.to_string())),
    }
}
