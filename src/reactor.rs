//! Readiness loop plumbing shared by every daemon.
//!
//! Sources are registered in oneshot mode, so each event must be followed by a [`Reactor::rearm`]
//! with the interest the owner still has. Background threads never touch daemon state; they send
//! a message on a channel and wake the poller.

use std::io;
use std::os::fd::{AsFd, AsRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time;

pub type Key = usize;

/// Readiness reported for one source.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Ready {
    pub key: Key,
    pub readable: bool,
    pub writable: bool,
}

pub struct Reactor {
    poller: Arc<polling::Poller>,
    events: polling::Events,
    next_key: Key,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Arc::new(polling::Poller::new()?),
            events: polling::Events::new(),
            next_key: 1,
        })
    }

    /// Handle used by other threads to wake [`Reactor::wait`].
    pub fn waker(&self) -> Arc<polling::Poller> {
        Arc::clone(&self.poller)
    }

    /// Registers `source` under a fresh key.
    pub fn add<S>(&mut self, source: &S, readable: bool, writable: bool) -> io::Result<Key>
    where
        S: AsRawFd + AsFd,
    {
        let key = self.next_key;
        self.next_key += 1;

        unsafe {
            // The owner deletes the source before dropping it
            self.poller
                .add(source.as_raw_fd(), polling::Event::new(key, readable, writable))?;
        }

        Ok(key)
    }

    pub fn rearm<S>(&self, source: &S, key: Key, readable: bool, writable: bool) -> io::Result<()>
    where
        S: AsFd,
    {
        self.poller
            .modify(source, polling::Event::new(key, readable, writable))
    }

    pub fn remove<S>(&self, source: &S)
    where
        S: AsFd,
    {
        if let Err(err) = self.poller.delete(source) {
            log::debug!("failed to deregister source: {}", err);
        }
    }

    /// Blocks until a source is ready or the poller is woken.
    pub fn wait(&mut self, timeout: Option<time::Duration>) -> io::Result<Vec<Ready>> {
        self.events.clear();

        match self.poller.wait(&mut self.events, timeout) {
            Ok(_) => (),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(err) => return Err(err),
        }

        Ok(self
            .events
            .iter()
            .map(|event| Ready {
                key: event.key,
                readable: event.readable,
                writable: event.writable,
            })
            .collect())
    }
}

#[derive(Debug)]
pub struct Tick;

/// Sends a [`Tick`] and wakes the poller every `interval` until `stop` is raised or the receiver
/// goes away.
pub fn spawn_ticker(
    waker: Arc<polling::Poller>,
    interval: time::Duration,
    stop: Arc<AtomicBool>,
) -> io::Result<(mpsc::Receiver<Tick>, thread::JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel();

    let handle = thread::Builder::new()
        .name("ticker".into())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                thread::sleep(interval);

                if tx.send(Tick).is_err() {
                    break;
                }

                if let Err(err) = waker.notify() {
                    log::error!("failed to wake poller: {}", err);
                }
            }
        })?;

    Ok((rx, handle))
}

/// Counts pending ticks without blocking.
pub fn drain_ticks(ticks: &mpsc::Receiver<Tick>) -> usize {
    ticks.try_iter().count()
}

/// A single-threaded event loop owner.
pub trait Daemon {
    fn reactor(&mut self) -> &mut Reactor;

    fn now_ms(&self) -> u64;

    fn tick_interval(&self) -> time::Duration;

    // Called for every ready source
    fn handle_ready(&mut self, ready: Ready, now_ms: u64);

    // Called after every wakeup, including ones raised by `Poller::notify`
    fn handle_wakeup(&mut self, _now_ms: u64) {}

    // Called once per elapsed tick interval, on the loop thread
    fn handle_tick(&mut self, now_ms: u64);

    // Called once when `stop` is raised, before returning
    fn shutdown(&mut self, now_ms: u64);
}

/// Runs `daemon` until `stop` is raised.
pub fn run<D: Daemon>(daemon: &mut D, stop: &AtomicBool) -> io::Result<()> {
    let ticker_stop = Arc::new(AtomicBool::new(false));

    let (ticks, ticker) = spawn_ticker(
        daemon.reactor().waker(),
        daemon.tick_interval(),
        Arc::clone(&ticker_stop),
    )?;

    while !stop.load(Ordering::Relaxed) {
        let ready = daemon.reactor().wait(None)?;

        let now_ms = daemon.now_ms();

        for entry in ready {
            daemon.handle_ready(entry, now_ms);
        }

        daemon.handle_wakeup(now_ms);

        if drain_ticks(&ticks) > 0 {
            let now_ms = daemon.now_ms();
            daemon.handle_tick(now_ms);
        }
    }

    let now_ms = daemon.now_ms();
    daemon.shutdown(now_ms);

    ticker_stop.store(true, Ordering::Relaxed);

    if ticker.join().is_err() {
        log::error!("ticker thread panicked");
    }

    Ok(())
}
