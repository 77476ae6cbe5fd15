//! The single guest-to-host transfer primitive.

use crate::record::CallRecord;
use std::sync::Arc;

/// Hands a call record to the host and blocks until every out-field and the
/// result have been written.
///
/// A trap never fails: failures of the wrapped API travel back as ordinary
/// return values, and protocol violations abort.
pub trait SyscallTrap: Send + Sync {
    fn trap(&self, record: &mut CallRecord);
}

impl<T: SyscallTrap + ?Sized> SyscallTrap for &T {
    fn trap(&self, record: &mut CallRecord) {
        (**self).trap(record)
    }
}

impl<T: SyscallTrap + ?Sized> SyscallTrap for Arc<T> {
    fn trap(&self, record: &mut CallRecord) {
        (**self).trap(record)
    }
}

impl<T: SyscallTrap + ?Sized> SyscallTrap for Box<T> {
    fn trap(&self, record: &mut CallRecord) {
        (**self).trap(record)
    }
}
