/// Runs a cleanup closure for the cache when its owner goes away.
///
/// Handles carry one of these to tie bookkeeping to their lifetime: dropping
/// a task handle unsubscribes it from its execution, dropping a termination
/// handle deregisters the waiter, and a driver task dropping its token
/// settles an execution whose producer unwound. The closure is boxed so the
/// handle types do not have to carry the cache's key type parameter around.
///
/// The closure must not panic; it runs during drop, possibly mid-unwind.
pub(crate) struct DropHook {
    hook: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl DropHook {
    pub(crate) fn new<F: FnOnce() + Send + 'static>(hook: F) -> DropHook {
        DropHook {
            hook: Some(Box::new(hook)),
        }
    }
}

impl Drop for DropHook {
    fn drop(&mut self) {
        if let Some(hook) = self.hook.take() {
            hook();
        }
    }
}
