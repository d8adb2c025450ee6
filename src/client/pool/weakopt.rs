use std::fmt;
use std::sync::Arc;
use std::sync::Weak;

use crate::DebugLiteral;

/// A weak reference that may be unset, used by the sweep task so it never keeps the pool alive.
pub(crate) struct WeakOpt<T>(Option<Weak<T>>);

impl<T> WeakOpt<T> {
    #[cfg(test)]
    pub(crate) fn none() -> Self {
        Self(None)
    }

    pub(crate) fn downgrade(arc: &Arc<T>) -> Self {
        Self(Some(Arc::downgrade(arc)))
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<T>> {
        self.0.as_ref().and_then(Weak::upgrade)
    }
}

impl<T> Clone for WeakOpt<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> fmt::Debug for WeakOpt<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.0.is_some() {
            "Some(...)"
        } else {
            "None"
        };
        f.debug_tuple("WeakOpt")
            .field(&DebugLiteral(state))
            .finish()
    }
}
