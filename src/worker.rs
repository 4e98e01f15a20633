//! Worker CPU threads that stage tile data for device transfers.

use {
    crate::{buffer::RasterBuffer, color::PixelFormat, math::Rect},
    log::debug,
    parking_lot::{Condvar, Mutex},
    std::{
        sync::{
            mpsc::{channel, Receiver, Sender},
            Arc,
        },
        thread::{Builder as ThreadBuilder, JoinHandle},
    },
};

struct Task {
    band: SendSlice,
    buffer: Arc<RasterBuffer>,
    done: Arc<TaskGroup>,
    fmt: PixelFormat,
    roi: Rect,
    write: bool,
}

#[derive(Default)]
struct TaskGroup {
    cond: Condvar,
    remaining: Mutex<usize>,
}

/// Raw view into the caller's staging buffer.
///
/// Bands are row-disjoint and the caller blocks until every band completes,
/// so the pointed-to region is exclusive to one worker for the duration of
/// the transfer.
struct SendSlice {
    len: usize,
    ptr: *mut u8,
}

unsafe impl Send for SendSlice {}

/// Fixed-size pool of threads that split a transfer rectangle into
/// horizontal bands and run the tile store copies in parallel.
#[derive(Debug)]
pub(crate) struct WorkerPool {
    threads: Vec<JoinHandle<()>>,
    tx: Option<Mutex<Sender<Task>>>,
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0);

        let (tx, rx) = channel::<Task>();
        let rx = Arc::new(Mutex::new(rx));
        let threads = (0..workers)
            .map(|at| {
                let rx = Arc::clone(&rx);

                ThreadBuilder::new()
                    .name(format!("tilestream-worker-{at}"))
                    .spawn(move || worker(&rx))
                    .expect("unable to spawn worker thread")
            })
            .collect();

        debug!("started {} transfer workers", workers);

        Self {
            threads,
            tx: Some(Mutex::new(tx)),
            workers,
        }
    }

    /// Copies `roi` between the tile store and the tightly packed `data`,
    /// blocking until every band has completed.
    #[profiling::function]
    pub fn transfer(
        &self,
        buffer: &Arc<RasterBuffer>,
        data: &mut [u8],
        pixel_size: usize,
        roi: Rect,
        fmt: PixelFormat,
        write: bool,
    ) {
        let split = roi.height / self.workers as i32;
        let done = Arc::new(TaskGroup {
            cond: Condvar::new(),
            remaining: Mutex::new(self.workers),
        });
        let mut offset = 0;

        {
            let tx = self
                .tx
                .as_ref()
                .expect("worker pool already shut down")
                .lock();

            for tid in 0..self.workers {
                let mut band = Rect::new(roi.x, roi.y + split * tid as i32, roi.width, split);

                if tid == self.workers - 1 {
                    band.height += roi.height % self.workers as i32;
                }

                let len = band.area() as usize * pixel_size;

                debug_assert!(offset + len <= data.len());

                let task = Task {
                    band: SendSlice {
                        len,
                        // SAFETY: bands are disjoint sub-slices of `data` and
                        // this call joins every band before returning
                        ptr: unsafe { data.as_mut_ptr().add(offset) },
                    },
                    buffer: Arc::clone(buffer),
                    done: Arc::clone(&done),
                    fmt,
                    roi: band,
                    write,
                };

                tx.send(task).expect("worker threads stopped");

                offset += len;
            }
        }

        let mut remaining = done.remaining.lock();

        while *remaining != 0 {
            done.cond.wait(&mut remaining);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // closing the channel stops the workers
        self.tx = None;

        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

fn worker(rx: &Mutex<Receiver<Task>>) {
    loop {
        let task = {
            let rx = rx.lock();

            rx.recv()
        };

        let Ok(task) = task else {
            break;
        };

        run(&task);

        let mut remaining = task.done.remaining.lock();

        *remaining -= 1;

        if *remaining == 0 {
            task.done.cond.notify_one();
        }
    }
}

fn run(task: &Task) {
    if task.roi.is_empty() {
        return;
    }

    // SAFETY: `SendSlice` invariant: exclusive, live for the transfer call
    let band = unsafe { std::slice::from_raw_parts_mut(task.band.ptr, task.band.len) };

    if task.write {
        task.buffer.set(task.roi, task.fmt, band, None);
    } else {
        task.buffer.get(task.roi, task.fmt, band, None);
    }
}
