pub mod time;

use std::sync::Arc;

/// Remove at most one occurrence of `item` (by pointer identity) from a vec of
/// shared references. Returns the removed entry so the caller controls when
/// the reference is dropped.
pub(crate) fn remove_arc<T>(list: &mut Vec<Arc<T>>, item: &Arc<T>) -> Option<Arc<T>> {
    let pos = list.iter().position(|e| Arc::ptr_eq(e, item))?;
    Some(list.remove(pos))
}

/// True if `item` is present (by pointer identity) in the list.
pub(crate) fn contains_arc<T>(list: &[Arc<T>], item: &Arc<T>) -> bool {
    list.iter().any(|e| Arc::ptr_eq(e, item))
}
