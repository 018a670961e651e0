//! Explicit call-context tagging.
//!
//! Every outbound call carries the depth of the call it is made from. A
//! call made while handling an inbound call is reentrant and must not wait
//! on the primary channel, which may still be carrying the outer call.

// ============================================================================
// CallContext
// ============================================================================

/// Call depth of an outbound RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CallContext {
    depth: u32,
}

impl CallContext {
    /// Context of a call made outside any RPC handler.
    #[inline]
    #[must_use]
    pub const fn root() -> Self {
        Self { depth: 0 }
    }

    /// Context of a handler serving a call made at `caller_depth`.
    #[inline]
    #[must_use]
    pub const fn serving(caller_depth: u32) -> Self {
        Self {
            depth: caller_depth.saturating_add(1),
        }
    }

    /// Context one level deeper than this one.
    #[inline]
    #[must_use]
    pub const fn nested(&self) -> Self {
        Self::serving(self.depth)
    }

    /// Returns the call depth.
    #[inline]
    #[must_use]
    pub const fn depth(&self) -> u32 {
        self.depth
    }

    /// Returns `true` if this call happens inside another call.
    #[inline]
    #[must_use]
    pub const fn is_reentrant(&self) -> bool {
        self.depth > 0
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_is_not_reentrant() {
        assert!(!CallContext::root().is_reentrant());
        assert_eq!(CallContext::default(), CallContext::root());
    }

    #[test]
    fn test_nesting_increments_depth() {
        let handler = CallContext::serving(0);
        assert!(handler.is_reentrant());
        assert_eq!(handler.nested().depth(), 2);
        assert_eq!(CallContext::serving(u32::MAX).depth(), u32::MAX);
    }
}
