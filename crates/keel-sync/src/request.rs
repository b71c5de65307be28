//! Work descriptors handed out by the window.

use std::fmt;

use keel_core::types::{BlockHeader, HeaderAnchor};

/// A header range the window wants someone to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadersRequest {
    pub anchor: HeaderAnchor,
    pub count: usize,
    pub skip: u64,
    pub reverse: bool,
}

impl HeadersRequest {
    /// `count` consecutive headers starting at `start`.
    pub fn forward(start: u64, count: usize) -> Self {
        Self {
            anchor: HeaderAnchor::Number(start),
            count,
            skip: 0,
            reverse: false,
        }
    }

    /// `count` consecutive headers ending at `top`, returned top first.
    pub fn backward(top: u64, count: usize) -> Self {
        Self {
            anchor: HeaderAnchor::Number(top),
            count,
            skip: 0,
            reverse: true,
        }
    }

    /// Inclusive number range covered, if number-anchored.
    pub fn range(&self) -> Option<(u64, u64)> {
        let HeaderAnchor::Number(n) = self.anchor else {
            return None;
        };
        let span = (self.count as u64).saturating_sub(1).saturating_mul(self.skip + 1);
        if self.reverse {
            Some((n.saturating_sub(span), n))
        } else {
            Some((n, n.saturating_add(span)))
        }
    }
}

impl fmt::Display for HeadersRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "headers[{} x{}{}{}]",
            self.anchor,
            self.count,
            if self.skip > 0 { format!(" skip {}", self.skip) } else { String::new() },
            if self.reverse { " rev" } else { "" }
        )
    }
}

/// Headers whose bodies the window is still missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlocksRequest {
    pub headers: Vec<BlockHeader>,
}

impl BlocksRequest {
    pub fn new(headers: Vec<BlockHeader>) -> Self {
        Self { headers }
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// Split into sub-requests of at most `max` headers each, preserving
    /// order, so the work can be spread over several peers.
    pub fn split(self, max: usize) -> Vec<BlocksRequest> {
        if max == 0 {
            return Vec::new();
        }
        self.headers
            .chunks(max)
            .map(|chunk| BlocksRequest::new(chunk.to_vec()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::chain;
    use proptest::prelude::*;

    #[test]
    fn forward_range() {
        let req = HeadersRequest::forward(10, 5);
        assert_eq!(req.range(), Some((10, 14)));
        assert_eq!(req.to_string(), "headers[#10 x5]");
    }

    #[test]
    fn backward_range() {
        let req = HeadersRequest::backward(10, 5);
        assert_eq!(req.range(), Some((6, 10)));
        assert_eq!(req.to_string(), "headers[#10 x5 rev]");
    }

    #[test]
    fn hash_anchor_has_no_range() {
        let req = HeadersRequest {
            anchor: HeaderAnchor::Hash(chain::genesis().hash()),
            count: 1,
            skip: 0,
            reverse: false,
        };
        assert_eq!(req.range(), None);
    }

    #[test]
    fn split_preserves_order() {
        let headers: Vec<_> = chain::chain(7).into_iter().map(|b| b.header).collect();
        let parts = BlocksRequest::new(headers.clone()).split(3);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 3);
        assert_eq!(parts[2].len(), 1);
        let rejoined: Vec<_> = parts.into_iter().flat_map(|p| p.headers).collect();
        assert_eq!(rejoined, headers);
    }

    #[test]
    fn split_by_zero_is_empty() {
        let headers: Vec<_> = chain::chain(2).into_iter().map(|b| b.header).collect();
        assert!(BlocksRequest::new(headers).split(0).is_empty());
    }

    proptest! {
        #[test]
        fn split_chunks_are_bounded_and_complete(len in 0usize..60, max in 1usize..20) {
            let headers: Vec<_> = chain::chain(len).into_iter().map(|b| b.header).collect();
            let parts = BlocksRequest::new(headers.clone()).split(max);
            prop_assert_eq!(parts.len(), len.div_ceil(max));
            prop_assert!(parts.iter().all(|p| !p.is_empty() && p.len() <= max));
            let rejoined: Vec<_> = parts.into_iter().flat_map(|p| p.headers).collect();
            prop_assert_eq!(rejoined, headers);
        }
    }
}
