//! Output capture
//!
//! Only one capture window may be open per process. [`OutputCapture::begin`]
//! takes the global capture lock and hands out a private sink; the interpreter's
//! `sys.stdout` is pointed at that sink for as long as the [`StdoutRedirect`]
//! guard lives, and is put back when it drops, however the execution ended.

use lazy_static::lazy_static;
use rustpython_vm::function::FuncArgs;
use rustpython_vm::{PyObjectRef, PyResult, VirtualMachine};
use std::sync::{Arc, Mutex, MutexGuard};

lazy_static! {
    static ref CAPTURE_LOCK: Mutex<()> = Mutex::new(());
}

/// Text buffer shared between the capture window and the interpreter hooks
#[derive(Debug, Clone, Default)]
pub struct OutputSink {
    buffer: Arc<Mutex<String>>,
}

impl OutputSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, text: &str) {
        self.lock().push_str(text);
    }

    pub fn contents(&self) -> String {
        self.lock().clone()
    }

    pub fn take(&self) -> String {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, String> {
        // A panic while holding the buffer leaves valid text behind
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// An open capture window. Holds the process-wide capture lock until finished or dropped.
pub struct OutputCapture {
    sink: OutputSink,
    _lock: MutexGuard<'static, ()>,
}

impl OutputCapture {
    /// Block until no other capture is active, then open a window with an empty sink
    pub fn begin() -> Self {
        let lock = CAPTURE_LOCK.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("output capture lock was poisoned by a panicked execution; recovering");
            poisoned.into_inner()
        });
        Self {
            sink: OutputSink::new(),
            _lock: lock,
        }
    }

    /// Non-blocking variant of [`OutputCapture::begin`]
    pub fn try_begin() -> Option<Self> {
        let lock = match CAPTURE_LOCK.try_lock() {
            Ok(lock) => lock,
            Err(std::sync::TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(std::sync::TryLockError::WouldBlock) => return None,
        };
        Some(Self {
            sink: OutputSink::new(),
            _lock: lock,
        })
    }

    pub fn sink(&self) -> &OutputSink {
        &self.sink
    }

    /// Point `sys.stdout` of `vm` at this window's sink until the guard drops
    pub fn redirect<'vm>(&self, vm: &'vm VirtualMachine) -> PyResult<StdoutRedirect<'vm>> {
        let original = vm.sys_module.get_attr("stdout", vm)?;
        let writer = build_writer_object(vm, self.sink.clone());
        vm.sys_module.set_attr("stdout", writer, vm)?;
        Ok(StdoutRedirect { vm, original })
    }

    /// Close the window, releasing the lock, and return everything captured
    pub fn finish(self) -> String {
        self.sink.take()
    }
}

/// Restores the interpreter's original `sys.stdout` on drop
pub struct StdoutRedirect<'vm> {
    vm: &'vm VirtualMachine,
    original: PyObjectRef,
}

impl Drop for StdoutRedirect<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.vm.sys_module.set_attr("stdout", self.original.clone(), self.vm) {
            tracing::error!(error = ?e, "failed to restore sys.stdout after capture");
        }
    }
}

/// A minimal file-like object whose `write(s)` appends to `sink`
fn build_writer_object(vm: &VirtualMachine, sink: OutputSink) -> PyObjectRef {
    let write_fn = vm.new_function("write", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
        let text = match args.args.first() {
            Some(obj) => obj.str(vm)?.as_str().to_owned(),
            None => return Err(vm.new_type_error("write() takes exactly one argument".to_owned())),
        };
        sink.write(&text);
        Ok(vm.ctx.new_int(text.chars().count()).into())
    });

    let flush_fn = vm.new_function("flush", |_args: FuncArgs, vm: &VirtualMachine| -> PyResult {
        Ok(vm.ctx.none())
    });

    let writer = vm.new_module("<capture>", vm.ctx.new_dict(), None);
    let _ = writer.set_attr("write", write_fn, vm);
    let _ = writer.set_attr("flush", flush_fn, vm);
    let _ = writer.set_attr("closed", vm.ctx.new_bool(false), vm);
    let _ = writer.set_attr("encoding", vm.ctx.new_str("utf-8"), vm);
    writer.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_sink_accumulates_and_takes() {
        let sink = OutputSink::new();
        sink.write("Hello ");
        sink.write("World\n");
        assert_eq!(sink.contents(), "Hello World\n");
        assert_eq!(sink.take(), "Hello World\n");
        assert_eq!(sink.contents(), "");
    }

    #[test]
    fn test_capture_window_is_exclusive() {
        let capture = OutputCapture::begin();
        let contender = thread::spawn(|| OutputCapture::try_begin().is_some());
        assert!(!contender.join().unwrap());
        capture.sink().write("done");
        assert_eq!(capture.finish(), "done");

        let after = thread::spawn(|| OutputCapture::begin().finish());
        assert_eq!(after.join().unwrap(), "");
    }

    #[test]
    fn test_capture_survives_poisoned_lock() {
        let _ = thread::spawn(|| {
            let _capture = OutputCapture::begin();
            panic!("execution panicked while capturing");
        })
        .join();

        let capture = OutputCapture::begin();
        capture.sink().write("ok");
        assert_eq!(capture.finish(), "ok");
    }
}
