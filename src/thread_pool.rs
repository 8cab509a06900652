use std::cell::Cell;
use std::fmt;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::trace;

use crate::event_loop::{EventLoop, LoopHandle};

/// Runs once on each freshly created loop thread, before the loop starts,
/// with the new loop in scope.
pub type ThreadInitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;

/// An OS thread owning exactly one event loop.
///
/// The loop is built on the spawned thread's stack; its handle is published
/// back to the creator before the loop starts running. Dropping the
/// `LoopThread` quits the loop and joins the thread.
pub struct LoopThread {
    handle: LoopHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl LoopThread {
    /// Spawn `name` and block until its loop is running far enough to hand
    /// out a handle. A loop that cannot be created reports the error back
    /// here instead of leaving a dead thread behind.
    pub fn start(name: String, init: Option<ThreadInitCallback>) -> io::Result<LoopThread> {
        let rendezvous = Arc::new((Mutex::new(None::<io::Result<LoopHandle>>), Condvar::new()));
        let published = Arc::clone(&rendezvous);

        let thread = thread::Builder::new().name(name).spawn(move || {
            let event_loop = match EventLoop::new() {
                Ok(event_loop) => event_loop,
                Err(err) => {
                    let (slot, ready) = &*published;
                    *slot.lock().unwrap() = Some(Err(err));
                    ready.notify_one();
                    return;
                }
            };
            if let Some(init) = init {
                init(&event_loop);
            }
            {
                let (slot, ready) = &*published;
                *slot.lock().unwrap() = Some(Ok(event_loop.handle()));
                ready.notify_one();
            }
            event_loop.run();
            trace!("loop thread exiting");
        })?;

        let (slot, ready) = &*rendezvous;
        let mut guard = slot.lock().unwrap();
        while guard.is_none() {
            guard = ready.wait(guard).unwrap();
        }
        match guard.take().unwrap() {
            Ok(handle) => Ok(LoopThread {
                handle,
                thread: Some(thread),
            }),
            Err(err) => {
                drop(guard);
                let _ = thread.join();
                Err(err)
            }
        }
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.handle.quit();
            let _ = thread.join();
        }
    }
}

impl fmt::Debug for LoopThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopThread")
            .field("handle", &self.handle)
            .finish()
    }
}

/// The worker loops connections are distributed over, selected round-robin.
///
/// With zero workers every connection shares the base loop, the single
/// threaded mode.
pub struct LoopThreadPool {
    base: LoopHandle,
    name: String,
    num_threads: usize,
    threads: Vec<LoopThread>,
    handles: Vec<LoopHandle>,
    next: Cell<usize>,
    started: Cell<bool>,
}

impl LoopThreadPool {
    pub fn new(base: LoopHandle, name: &str) -> LoopThreadPool {
        LoopThreadPool {
            base,
            name: name.to_string(),
            num_threads: 0,
            threads: Vec::new(),
            handles: Vec::new(),
            next: Cell::new(0),
            started: Cell::new(false),
        }
    }

    pub fn set_thread_count(&mut self, num_threads: usize) {
        self.num_threads = num_threads;
    }

    /// Spawn the workers. Must run on the base loop's thread; with zero
    /// workers the init callback runs directly on the base loop.
    pub fn start(
        &mut self,
        base_loop: &EventLoop,
        init: Option<ThreadInitCallback>,
    ) -> io::Result<()> {
        base_loop.assert_in_loop_thread();
        assert!(!self.started.get(), "thread pool started twice");
        self.started.set(true);

        for i in 0..self.num_threads {
            let thread = LoopThread::start(format!("{}-io-{}", self.name, i), init.clone())?;
            self.handles.push(thread.handle());
            self.threads.push(thread);
        }
        if self.num_threads == 0 {
            if let Some(init) = init {
                init(base_loop);
            }
        }
        Ok(())
    }

    /// The loop the next connection should live on: workers round-robin, or
    /// the base loop when there are none.
    pub fn next_loop(&self) -> LoopHandle {
        debug_assert!(self.started.get());
        if self.handles.is_empty() {
            return self.base.clone();
        }
        let index = self.next.get();
        self.next.set((index + 1) % self.handles.len());
        self.handles[index].clone()
    }

    /// A snapshot of every loop in the pool; just the base loop when there
    /// are no workers.
    pub fn all_loops(&self) -> Vec<LoopHandle> {
        if self.handles.is_empty() {
            vec![self.base.clone()]
        } else {
            self.handles.clone()
        }
    }
}

impl fmt::Debug for LoopThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopThreadPool")
            .field("name", &self.name)
            .field("num_threads", &self.num_threads)
            .field("started", &self.started.get())
            .finish()
    }
}
