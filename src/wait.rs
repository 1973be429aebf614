//! Batched fence waiting.
//!
//! Awaiting a fence with a blocking driver call burns one OS thread per
//! waiter. The scheduler multiplexes every waiter onto a single background
//! thread that polls the driver with one batched any-of wait per cycle.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll, Waker},
    thread::JoinHandle,
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use crate::{
    device::{Device, FenceStatus},
    error::{DeviceError, WaitError},
};

/// Sleep between cycles while no waiter is enqueued.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Timeout of one batched any-of wait.
const BATCH_WAIT_TIMEOUT_NS: u64 = 5_000_000;

#[derive(Debug)]
enum WaitState {
    Pending(Option<Waker>),
    Done(Result<(), WaitError>),
}

#[derive(Debug)]
struct WaitShared {
    state: Mutex<WaitState>,
    cond: Condvar,
}

impl WaitShared {
    fn pending() -> Arc<Self> {
        Arc::new(WaitShared {
            state: Mutex::new(WaitState::Pending(None)),
            cond: Condvar::new(),
        })
    }

    fn complete(&self, result: Result<(), WaitError>) {
        let mut state = self.state.lock();
        if let WaitState::Pending(waker) = &mut *state {
            let waker = waker.take();
            *state = WaitState::Done(result);
            self.cond.notify_all();
            drop(state);
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }
}

/// Completion handle of one fence wait.
///
/// Await it, block on [`wait`](WaitHandle::wait), or poll with
/// [`try_wait`](WaitHandle::try_wait).
#[derive(Debug)]
pub struct WaitHandle {
    shared: Arc<WaitShared>,
}

impl WaitHandle {
    fn ready(result: Result<(), WaitError>) -> Self {
        WaitHandle {
            shared: Arc::new(WaitShared {
                state: Mutex::new(WaitState::Done(result)),
                cond: Condvar::new(),
            }),
        }
    }

    /// Block the calling thread until the fence wait completes.
    pub fn wait(&self) -> Result<(), WaitError> {
        let mut state = self.shared.state.lock();
        loop {
            if let WaitState::Done(result) = &*state {
                return *result;
            }
            self.shared.cond.wait(&mut state);
        }
    }

    /// Completion status without blocking.
    pub fn try_wait(&self) -> Option<Result<(), WaitError>> {
        match &*self.shared.state.lock() {
            WaitState::Done(result) => Some(*result),
            WaitState::Pending(_) => None,
        }
    }
}

impl Future for WaitHandle {
    type Output = Result<(), WaitError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.state.lock();
        match &mut *state {
            WaitState::Done(result) => Poll::Ready(*result),
            WaitState::Pending(waker) => {
                *waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

struct Waiter<D: Device> {
    fence: D::Fence,
    shared: Arc<WaitShared>,
}

/// Fence wait scheduler over one dedicated thread.
///
/// Any driver error from the batched wait is terminal: every pending waiter
/// fails with it and later [`wait`](WaitScheduler::wait) calls are rejected
/// carrying the stored status. Pending waiters are not failed by disposal;
/// callers are expected to have drained their waits first.
pub struct WaitScheduler<D: Device + 'static> {
    device: Arc<D>,
    sender: Sender<Waiter<D>>,
    fatal: Arc<Mutex<Option<DeviceError>>>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl<D: Device + 'static> std::fmt::Debug for WaitScheduler<D> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("WaitScheduler")
            .field("fatal", &*self.fatal.lock())
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<D: Device + 'static> WaitScheduler<D> {
    /// Start the scheduler thread.
    pub fn new(device: Arc<D>) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let fatal = Arc::new(Mutex::new(None));
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread = {
            let device = Arc::clone(&device);
            let fatal = Arc::clone(&fatal);
            let shutdown = Arc::clone(&shutdown);
            std::thread::Builder::new()
                .name("fence-wait-scheduler".into())
                .spawn(move || run(device, receiver, fatal, shutdown))
                .expect("failed to spawn the fence wait scheduler thread")
        };
        WaitScheduler {
            device,
            sender,
            fatal,
            shutdown,
            thread: Some(thread),
        }
    }

    /// Wait for `fence`. Already-signaled fences complete immediately
    /// without touching the scheduler thread.
    pub fn wait(&self, fence: D::Fence) -> Result<WaitHandle, WaitError> {
        if let Some(err) = *self.fatal.lock() {
            return Err(WaitError::Defunct(err));
        }
        if self.shutdown.load(Ordering::Acquire) {
            return Err(WaitError::Disposed);
        }
        match self.device.fence_status(&fence) {
            Ok(FenceStatus::Signaled) => Ok(WaitHandle::ready(Ok(()))),
            Err(err) => Err(WaitError::Device(err)),
            Ok(FenceStatus::Unsignaled) => {
                let shared = WaitShared::pending();
                let handle = WaitHandle {
                    shared: Arc::clone(&shared),
                };
                self.sender
                    .send(Waiter { fence, shared })
                    .map_err(|_| WaitError::Disposed)?;
                Ok(handle)
            }
        }
    }

    /// Stop the scheduler thread and join it.
    pub fn dispose(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("fence wait scheduler thread panicked");
            }
        }
    }
}

impl<D: Device + 'static> Drop for WaitScheduler<D> {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

fn run<D: Device>(
    device: Arc<D>,
    receiver: Receiver<Waiter<D>>,
    fatal: Arc<Mutex<Option<DeviceError>>>,
    shutdown: Arc<AtomicBool>,
) {
    let mut fences: Vec<D::Fence> = Vec::new();
    let mut promises: Vec<Arc<WaitShared>> = Vec::new();

    while !shutdown.load(Ordering::Acquire) {
        // Drain new waiters.
        loop {
            match receiver.try_recv() {
                Ok(waiter) => {
                    if let Some(err) = *fatal.lock() {
                        waiter.shared.complete(Err(WaitError::Defunct(err)));
                    } else {
                        fences.push(waiter.fence);
                        promises.push(waiter.shared);
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        if fences.is_empty() {
            std::thread::sleep(IDLE_SLEEP);
            continue;
        }

        match device.wait_for_fences(&fences, false, BATCH_WAIT_TIMEOUT_NS) {
            // Timed out; every fence is still pending.
            Ok(false) => continue,
            Ok(true) => {
                let mut settled: SmallVec<[(usize, Result<(), WaitError>); 16]> = SmallVec::new();
                for (index, fence) in fences.iter().enumerate() {
                    match device.fence_status(fence) {
                        Ok(FenceStatus::Unsignaled) => {}
                        Ok(FenceStatus::Signaled) => settled.push((index, Ok(()))),
                        Err(err) => settled.push((index, Err(WaitError::Device(err)))),
                    }
                }
                for &(index, result) in settled.iter().rev() {
                    fences.swap_remove(index);
                    let promise = promises.swap_remove(index);
                    promise.complete(result);
                }
            }
            Err(err) => {
                // Terminal: fail everyone with the stored status.
                log::error!("batched fence wait failed: {}", err);
                *fatal.lock() = Some(err);
                fences.clear();
                for promise in promises.drain(..) {
                    promise.complete(Err(WaitError::Defunct(err)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{
        AllocateInfo, BufferInfo, ImageInfo, MemoryRequirements,
    };
    use crate::error::{AllocationError, MappingError, OutOfMemoryError};
    use std::collections::HashSet;
    use std::ptr::NonNull;

    #[derive(Debug, Default)]
    struct FenceDevice {
        signaled: Mutex<HashSet<u64>>,
        wait_error: Mutex<Option<DeviceError>>,
    }

    impl FenceDevice {
        fn signal(&self, fence: u64) {
            self.signaled.lock().insert(fence);
        }

        fn poison(&self, err: DeviceError) {
            *self.wait_error.lock() = Some(err);
        }
    }

    impl Device for FenceDevice {
        type Memory = u64;
        type Buffer = u64;
        type Image = u64;
        type Fence = u64;

        unsafe fn allocate(
            &self,
            _info: AllocateInfo<'_, Self>,
        ) -> Result<u64, AllocationError> {
            unimplemented!()
        }
        unsafe fn free(&self, _memory: u64) {
            unimplemented!()
        }
        unsafe fn map(&self, _memory: &u64) -> Result<NonNull<u8>, MappingError> {
            unimplemented!()
        }
        unsafe fn unmap(&self, _memory: &u64) {
            unimplemented!()
        }
        unsafe fn flush<'a>(
            &self,
            _regions: impl IntoIterator<Item = (&'a u64, std::ops::Range<u64>)>,
        ) -> Result<(), OutOfMemoryError> {
            unimplemented!()
        }
        unsafe fn invalidate<'a>(
            &self,
            _regions: impl IntoIterator<Item = (&'a u64, std::ops::Range<u64>)>,
        ) -> Result<(), OutOfMemoryError> {
            unimplemented!()
        }
        unsafe fn create_buffer(&self, _info: &BufferInfo) -> Result<u64, AllocationError> {
            unimplemented!()
        }
        unsafe fn destroy_buffer(&self, _buffer: u64) {
            unimplemented!()
        }
        fn buffer_requirements(&self, _buffer: &u64) -> MemoryRequirements {
            unimplemented!()
        }
        unsafe fn bind_buffer(
            &self,
            _buffer: &u64,
            _memory: &u64,
            _offset: u64,
        ) -> Result<(), DeviceError> {
            unimplemented!()
        }
        unsafe fn create_image(&self, _info: &ImageInfo) -> Result<u64, AllocationError> {
            unimplemented!()
        }
        unsafe fn destroy_image(&self, _image: u64) {
            unimplemented!()
        }
        fn image_requirements(&self, _image: &u64) -> MemoryRequirements {
            unimplemented!()
        }
        unsafe fn bind_image(
            &self,
            _image: &u64,
            _memory: &u64,
            _offset: u64,
        ) -> Result<(), DeviceError> {
            unimplemented!()
        }

        fn fence_status(&self, fence: &u64) -> Result<FenceStatus, DeviceError> {
            if self.signaled.lock().contains(fence) {
                Ok(FenceStatus::Signaled)
            } else {
                Ok(FenceStatus::Unsignaled)
            }
        }

        fn wait_for_fences(
            &self,
            fences: &[u64],
            _wait_all: bool,
            _timeout_ns: u64,
        ) -> Result<bool, DeviceError> {
            if let Some(err) = *self.wait_error.lock() {
                return Err(err);
            }
            let signaled = self.signaled.lock();
            if fences.iter().any(|fence| signaled.contains(fence)) {
                Ok(true)
            } else {
                drop(signaled);
                std::thread::sleep(Duration::from_millis(1));
                Ok(false)
            }
        }
    }

    #[test]
    fn signaled_fence_completes_immediately() {
        let device = Arc::new(FenceDevice::default());
        device.signal(1);
        let scheduler = WaitScheduler::new(Arc::clone(&device));
        let handle = scheduler.wait(1).unwrap();
        assert_eq!(handle.try_wait(), Some(Ok(())));
        scheduler.dispose();
    }

    #[test]
    fn only_signaled_waiters_complete() {
        let device = Arc::new(FenceDevice::default());
        let scheduler = WaitScheduler::new(Arc::clone(&device));
        let handles: Vec<WaitHandle> = (1..=10)
            .map(|fence| scheduler.wait(fence).unwrap())
            .collect();
        assert!(handles.iter().all(|handle| handle.try_wait().is_none()));

        device.signal(5);
        assert_eq!(handles[4].wait(), Ok(()));
        // One wait cycle settles exactly the signaled fence.
        for (index, handle) in handles.iter().enumerate() {
            if index != 4 {
                assert!(handle.try_wait().is_none());
            }
        }
        scheduler.dispose();
    }

    #[test]
    fn driver_error_is_terminal() {
        let device = Arc::new(FenceDevice::default());
        let scheduler = WaitScheduler::new(Arc::clone(&device));
        let handle = scheduler.wait(1).unwrap();
        device.poison(DeviceError(-4));
        assert_eq!(handle.wait(), Err(WaitError::Defunct(DeviceError(-4))));
        // Later waiters are rejected with the stored status.
        loop {
            match scheduler.wait(2) {
                Err(WaitError::Defunct(DeviceError(-4))) => break,
                Ok(_) => std::thread::sleep(Duration::from_millis(1)),
                Err(err) => panic!("unexpected error: {err:?}"),
            }
        }
        scheduler.dispose();
    }

    #[test]
    fn handle_is_a_future() {
        let device = Arc::new(FenceDevice::default());
        device.signal(7);
        let scheduler = WaitScheduler::new(Arc::clone(&device));
        let mut handle = scheduler.wait(7).unwrap();
        let waker = futures_noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(matches!(
            Pin::new(&mut handle).poll(&mut cx),
            Poll::Ready(Ok(()))
        ));
        scheduler.dispose();
    }

    fn futures_noop_waker() -> Waker {
        use std::task::{RawWaker, RawWakerVTable};
        fn clone(_: *const ()) -> RawWaker {
            RawWaker::new(std::ptr::null(), &VTABLE)
        }
        fn noop(_: *const ()) {}
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
        unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
    }
}
