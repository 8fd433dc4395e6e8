//! The generic read/transform/write worker pool.
//!
//! A stage plugs its callbacks into N worker threads fed by one source bus
//! and draining to at most one sink bus. Input order is preserved on the
//! output: every worker takes a shared open lock, opens its read packet and
//! its write packet, and only then releases the lock. Since bus order is
//! fixed at open time, the heavy transform work runs fully parallel outside
//! the lock without ever reordering the stream.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use kinescope_bus::{Buffer, BusError};
use kinescope_common::{Tag, MESSAGE_HEADER_SIZE};
use parking_lot::Mutex;

use crate::PipelineError;

/// Per message control block handed to every callback.
pub struct StageCtl {
    /// Message tag. A stage may rewrite it (the compressor does).
    pub tag: Tag,
    /// Input payload size, excluding the tag byte.
    pub read_size: usize,
    /// Output payload size the worker will reserve. Defaults to the input
    /// size; `on_read` adjusts it, `on_write` may shrink it when the stage
    /// declared an unknown final size.
    pub write_size: usize,
    copy: bool,
    skip_write: bool,
    unknown_final_size: bool,
    stop: bool,
}

impl StageCtl {
    fn new(tag: Tag, read_size: usize) -> Self {
        Self {
            tag,
            read_size,
            write_size: read_size,
            copy: false,
            skip_write: false,
            unknown_final_size: false,
            stop: false,
        }
    }

    /// Forward the payload verbatim; `on_write` is not called.
    pub fn copy(&mut self) {
        self.copy = true;
    }

    /// Consume the message without writing anything downstream.
    pub fn skip_write(&mut self) {
        self.skip_write = true;
    }

    /// The reservation in `write_size` is a worst case; the final size is
    /// whatever `on_write` leaves in `write_size`.
    pub fn unknown_final_size(&mut self) {
        self.unknown_final_size = true;
    }

    /// Quit this worker gracefully after the current message.
    pub fn stop(&mut self) {
        self.stop = true;
    }
}

/// What a worker iteration does before touching the source bus. The
/// default reads the next packet; a stage that produces data of its own
/// may skip the read and emit a message outright.
pub enum OpenAction {
    Read,
    Generate { tag: Tag, write_size: usize },
}

/// A pipeline stage: stage-wide state plus callbacks. Each worker thread
/// gets its own `Worker` scratch value.
pub trait Stage: Send + Sync + 'static {
    type Worker: Send;

    fn name(&self) -> &'static str;

    fn start_worker(&self) -> Result<Self::Worker, PipelineError>;

    /// Called before the input packet is opened.
    fn on_open(&self, _worker: &mut Self::Worker) -> Result<OpenAction, PipelineError> {
        Ok(OpenAction::Read)
    }

    /// Called when the tag and payload size are known, before the payload
    /// is mapped.
    fn on_header(
        &self,
        _ctl: &mut StageCtl,
        _worker: &mut Self::Worker,
    ) -> Result<(), PipelineError> {
        Ok(())
    }

    /// The whole input payload is available. The default forwards it
    /// untouched.
    fn on_read(
        &self,
        ctl: &mut StageCtl,
        _data: &[u8],
        _worker: &mut Self::Worker,
    ) -> Result<(), PipelineError> {
        ctl.copy();
        Ok(())
    }

    /// The output region is mapped; fill it.
    fn on_write(
        &self,
        _ctl: &mut StageCtl,
        _read: &[u8],
        _write: &mut [u8],
        _worker: &mut Self::Worker,
    ) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Both packets are closed.
    fn on_close(&self, _ctl: &mut StageCtl, _worker: &mut Self::Worker) {}

    fn finish_worker(&self, _worker: Self::Worker) {}

    /// Called exactly once, after the last worker has exited, with the
    /// first recorded fatal error if any.
    fn finish(&self, _err: Option<&PipelineError>) {}
}

struct Control<S: Stage> {
    stage: S,
    from: Buffer,
    to: Option<Buffer>,
    /// Serializes read-open + write-open pairs across workers; this is the
    /// whole order preservation mechanism.
    open_lock: Mutex<()>,
    quit: AtomicBool,
    saw_close: AtomicBool,
    remaining: AtomicUsize,
    first_err: Mutex<Option<PipelineError>>,
}

/// A running stage. Join it to collect the first fatal error.
pub struct Process {
    threads: Vec<JoinHandle<()>>,
    err: Arc<Mutex<Option<PipelineError>>>,
}

impl Process {
    pub fn join(self) -> Result<(), PipelineError> {
        for handle in self.threads {
            let _ = handle.join();
        }
        match self.err.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Start `threads` workers for `stage` (0 picks the number of online
/// processors), reading from `from` and draining to `to`.
pub fn spawn<S: Stage>(
    stage: S,
    from: &Buffer,
    to: Option<&Buffer>,
    threads: usize,
) -> Result<Process, PipelineError> {
    let threads = if threads == 0 {
        num_cpus::get().max(1)
    } else {
        threads
    };

    let err = Arc::new(Mutex::new(None));
    let control = Arc::new(Control {
        stage,
        from: from.clone(),
        to: to.cloned(),
        open_lock: Mutex::new(()),
        quit: AtomicBool::new(false),
        saw_close: AtomicBool::new(false),
        remaining: AtomicUsize::new(threads),
        first_err: Mutex::new(None),
    });

    let mut handles = Vec::with_capacity(threads);
    for n in 0..threads {
        let control = control.clone();
        let err = err.clone();
        handles.push(
            thread::Builder::new()
                .name(format!("{}-{}", control.stage.name(), n))
                .spawn(move || worker_main(control, err))?,
        );
    }

    Ok(Process {
        threads: handles,
        err,
    })
}

fn worker_main<S: Stage>(control: Arc<Control<S>>, err_out: Arc<Mutex<Option<PipelineError>>>) {
    let result = match control.stage.start_worker() {
        Ok(mut worker) => {
            let result = worker_loop(&control, &mut worker);
            control.stage.finish_worker(worker);
            result
        }
        Err(err) => Err(err),
    };

    let err = match result {
        Err(err) if !err.is_interrupted() => {
            log::error!("{}: worker failed: {}", control.stage.name(), err);
            Some(err)
        }
        _ => None,
    };

    let fatal = err.is_some();
    if let Some(err) = err {
        let mut first = control.first_err.lock();
        if first.is_none() {
            *first = Some(err);
        }
    }

    // First worker out wakes the siblings still blocked on the source.
    if !control.quit.swap(true, Ordering::SeqCst) || fatal {
        control.from.cancel();
        if fatal {
            if let Some(to) = &control.to {
                to.cancel();
            }
        }
    }

    if control.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
        // Without a forwarded close envelope the downstream bus would wait
        // forever, so cancellation has to travel on.
        if !control.saw_close.load(Ordering::SeqCst) {
            if let Some(to) = &control.to {
                to.cancel();
            }
        }

        let first = control.first_err.lock().take();
        control.stage.finish(first.as_ref());
        *err_out.lock() = first;
    }
}

fn worker_loop<S: Stage>(control: &Control<S>, worker: &mut S::Worker) -> Result<(), PipelineError> {
    let mut read = control.from.reader();
    let mut write = control.to.as_ref().map(|to| to.writer());

    loop {
        if control.quit.load(Ordering::SeqCst) {
            return Ok(());
        }

        if let OpenAction::Generate { tag, write_size } = control.stage.on_open(worker)? {
            let mut ctl = StageCtl::new(tag, 0);
            ctl.write_size = write_size;

            let wp = {
                let _guard = control.open_lock.lock();
                match &mut write {
                    Some(writer) => Some(writer.open()?),
                    None => None,
                }
            };

            if let Some(mut wp) = wp {
                wp.write(&[ctl.tag as u8])?;
                let out = wp.dma(ctl.write_size)?;
                control.stage.on_write(&mut ctl, &[], out, worker)?;
                if ctl.unknown_final_size {
                    wp.set_size(MESSAGE_HEADER_SIZE + ctl.write_size)?;
                }
                wp.close()?;
            }

            control.stage.on_close(&mut ctl, worker);
            if ctl.tag == Tag::Close {
                control.saw_close.store(true, Ordering::SeqCst);
                return Ok(());
            }
            if ctl.stop {
                return Ok(());
            }
            continue;
        }

        let guard = control.open_lock.lock();

        let mut rp = match read.open() {
            Ok(packet) => packet,
            Err(BusError::Interrupted) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let mut tag = [0u8];
        rp.read(&mut tag)?;
        let mut ctl = StageCtl::new(
            Tag::try_from(tag[0])?,
            rp.size() - MESSAGE_HEADER_SIZE,
        );

        control.stage.on_header(&mut ctl, worker)?;
        let payload = rp.dma(ctl.read_size)?;
        control.stage.on_read(&mut ctl, payload, worker)?;

        let wp = match &mut write {
            Some(writer) if !ctl.skip_write => Some(writer.open()?),
            _ => None,
        };
        drop(guard);

        if let Some(mut wp) = wp {
            wp.write(&[ctl.tag as u8])?;
            if ctl.copy {
                wp.write(payload)?;
            } else {
                let out = wp.dma(ctl.write_size)?;
                control.stage.on_write(&mut ctl, payload, out, worker)?;
                if ctl.unknown_final_size {
                    wp.set_size(MESSAGE_HEADER_SIZE + ctl.write_size)?;
                }
            }
            wp.close()?;
        }

        rp.close();
        control.stage.on_close(&mut ctl, worker);

        if ctl.tag == Tag::Close {
            control.saw_close.store(true, Ordering::SeqCst);
            return Ok(());
        }
        if ctl.stop {
            return Ok(());
        }
    }
}
