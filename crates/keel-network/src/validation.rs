//! Response validation.
//!
//! Pure checks of a reply against the request that produced it. Any error
//! returned here is a protocol violation and ends the connection.

use keel_core::crypto;
use keel_core::error::ProtocolError;
use keel_core::types::{BlockBody, BlockHeader, Hash256, HeaderAnchor, Receipt};

use crate::protocol::GetHeaders;

/// What the connection knew when the header request went out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplyContext {
    /// The request was the handshake's best-hash lookup.
    pub handshake: bool,
    /// Number of the peer's best block, once the handshake resolved it.
    pub peer_best: Option<u64>,
}

/// Check a `HEADERS` reply against its `GET_HEADERS` request.
pub fn validate_headers(
    headers: &[BlockHeader],
    request: &GetHeaders,
    ctx: ReplyContext,
) -> Result<(), ProtocolError> {
    let max = request.max_headers as usize;
    if headers.len() > max {
        return Err(ProtocolError::TooManyHeaders {
            got: headers.len(),
            max,
        });
    }

    let Some(first) = headers.first() else {
        if ctx.handshake {
            return Err(ProtocolError::EmptyHandshakeReply);
        }
        // Hash-anchored misses are tolerated: the peer may have reorganized.
        if let (HeaderAnchor::Number(anchor), Some(best)) = (request.anchor(), ctx.peer_best) {
            if anchor < best {
                return Err(ProtocolError::EmptyReplyBelowBest { anchor, best });
            }
        }
        return Ok(());
    };

    let anchored = match request.anchor() {
        HeaderAnchor::Number(n) => first.number == n,
        HeaderAnchor::Hash(h) => first.hash() == h,
    };
    if !anchored {
        return Err(ProtocolError::AnchorMismatch);
    }

    let step = request.skip.saturating_add(1);
    for (i, pair) in headers.windows(2).enumerate() {
        let (prev, next) = (&pair[0], &pair[1]);
        let expected = if request.reverse {
            prev.number.checked_sub(step)
        } else {
            prev.number.checked_add(step)
        };
        if expected != Some(next.number) {
            return Err(ProtocolError::BadStep { index: i + 1 });
        }
        if request.skip == 0 {
            let linked = if request.reverse {
                prev.parent_hash == next.hash()
            } else {
                next.parent_hash == prev.hash()
            };
            if !linked {
                return Err(ProtocolError::BrokenLink { index: i + 1 });
            }
        }
    }
    Ok(())
}

/// Check a `BODIES` reply. Bodies pair with the requested headers strictly
/// in order; a peer may send fewer than requested but never reorder.
pub fn match_bodies(requested: &[BlockHeader], bodies: &[BlockBody]) -> Result<(), ProtocolError> {
    if bodies.len() > requested.len() {
        return Err(ProtocolError::TooManyBodies {
            got: bodies.len(),
            max: requested.len(),
        });
    }
    match requested.iter().zip(bodies).position(|(h, b)| !b.matches(h)) {
        Some(index) => Err(ProtocolError::BodyMismatch { index }),
        None => Ok(()),
    }
}

/// Check a `NODE_DATA` reply. Missing entries may be skipped but the rest
/// must follow request order. Returns the hash of each returned value.
pub fn validate_node_data(requested: &[Hash256], values: &[Vec<u8>]) -> Result<Vec<Hash256>, ProtocolError> {
    const KIND: &str = "node data";
    if values.is_empty() {
        return Err(ProtocolError::EmptyReply(KIND));
    }
    if values.len() > requested.len() {
        return Err(ProtocolError::TooManyEntries {
            kind: KIND,
            got: values.len(),
            max: requested.len(),
        });
    }
    let mut cursor = 0;
    let mut hashes = Vec::with_capacity(values.len());
    for (index, value) in values.iter().enumerate() {
        let hash = crypto::content_hash(value);
        match requested[cursor..].iter().position(|h| *h == hash) {
            Some(offset) => cursor += offset + 1,
            None => return Err(ProtocolError::UnrequestedEntry { kind: KIND, index }),
        }
        hashes.push(hash);
    }
    Ok(hashes)
}

/// Check a `RECEIPTS` reply. Lists pair with the requested headers in order
/// and must hash to each header's receipts root.
pub fn validate_receipts(requested: &[BlockHeader], lists: &[Vec<Receipt>]) -> Result<(), ProtocolError> {
    const KIND: &str = "receipts";
    if lists.is_empty() {
        return Err(ProtocolError::EmptyReply(KIND));
    }
    if lists.len() > requested.len() {
        return Err(ProtocolError::TooManyEntries {
            kind: KIND,
            got: lists.len(),
            max: requested.len(),
        });
    }
    match requested
        .iter()
        .zip(lists)
        .position(|(h, r)| crypto::receipts_root(r) != h.receipts_root)
    {
        Some(index) => Err(ProtocolError::UnrequestedEntry { kind: KIND, index }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::chain;

    fn headers(len: usize) -> Vec<BlockHeader> {
        chain::chain(len).into_iter().map(|b| b.header).collect()
    }

    fn forward(start: u64, max: usize) -> GetHeaders {
        GetHeaders::new(HeaderAnchor::Number(start), max, 0, false)
    }

    #[test]
    fn accepts_a_linked_forward_run() {
        let hs = headers(10);
        assert!(validate_headers(&hs[3..8], &forward(3, 5), ReplyContext::default()).is_ok());
    }

    #[test]
    fn more_than_max_is_invalid() {
        let hs = headers(12);
        let err = validate_headers(&hs[1..12], &forward(1, 10), ReplyContext::default()).unwrap_err();
        assert_eq!(err, ProtocolError::TooManyHeaders { got: 11, max: 10 });
    }

    #[test]
    fn empty_handshake_reply_is_invalid() {
        let req = GetHeaders::new(HeaderAnchor::Hash(Hash256([1; 32])), 1, 0, false);
        let ctx = ReplyContext {
            handshake: true,
            peer_best: None,
        };
        assert_eq!(validate_headers(&[], &req, ctx), Err(ProtocolError::EmptyHandshakeReply));
    }

    #[test]
    fn empty_reply_below_claimed_best_is_invalid() {
        let ctx = ReplyContext {
            handshake: false,
            peer_best: Some(100),
        };
        assert_eq!(
            validate_headers(&[], &forward(50, 10), ctx),
            Err(ProtocolError::EmptyReplyBelowBest { anchor: 50, best: 100 })
        );
        assert!(validate_headers(&[], &forward(100, 10), ctx).is_ok());
        let by_hash = GetHeaders::new(HeaderAnchor::Hash(Hash256([1; 32])), 10, 0, false);
        assert!(validate_headers(&[], &by_hash, ctx).is_ok());
    }

    #[test]
    fn first_header_must_match_anchor() {
        let hs = headers(10);
        assert_eq!(
            validate_headers(&hs[4..6], &forward(3, 5), ReplyContext::default()),
            Err(ProtocolError::AnchorMismatch)
        );
        let by_hash = GetHeaders::new(HeaderAnchor::Hash(hs[2].hash()), 3, 0, false);
        assert!(validate_headers(&hs[2..5], &by_hash, ReplyContext::default()).is_ok());
    }

    #[test]
    fn reverse_runs_link_downwards() {
        let hs = headers(10);
        let rev: Vec<_> = hs[2..7].iter().rev().cloned().collect();
        let req = GetHeaders::new(HeaderAnchor::Number(6), 5, 0, true);
        assert!(validate_headers(&rev, &req, ReplyContext::default()).is_ok());
        assert_eq!(
            validate_headers(&hs[2..7], &GetHeaders::new(HeaderAnchor::Number(2), 5, 0, true), ReplyContext::default()),
            Err(ProtocolError::BadStep { index: 1 })
        );
    }

    #[test]
    fn skip_checks_step_not_links() {
        let hs = headers(20);
        let picked = vec![hs[1].clone(), hs[4].clone(), hs[7].clone()];
        let req = GetHeaders::new(HeaderAnchor::Number(1), 3, 2, false);
        assert!(validate_headers(&picked, &req, ReplyContext::default()).is_ok());
    }

    #[test]
    fn broken_link_is_reported() {
        let hs = headers(5);
        let fork = chain::block_on(&hs[2], 9).header;
        let run = vec![hs[1].clone(), hs[2].clone(), fork, hs[4].clone()];
        assert_eq!(
            validate_headers(&run, &forward(1, 4), ReplyContext::default()),
            Err(ProtocolError::BrokenLink { index: 3 })
        );
    }

    #[test]
    fn bodies_pair_in_order() {
        let blocks = chain::chain(5);
        let hs: Vec<_> = blocks.iter().map(|b| b.header.clone()).collect();
        let bodies: Vec<_> = blocks.iter().map(|b| b.body.clone()).collect();
        assert!(match_bodies(&hs, &bodies[..3]).is_ok());
        assert!(match_bodies(&hs, &[]).is_ok());
        let swapped = vec![bodies[1].clone(), bodies[0].clone()];
        assert_eq!(match_bodies(&hs, &swapped), Err(ProtocolError::BodyMismatch { index: 0 }));
        assert!(matches!(match_bodies(&hs[..1], &bodies[..2]), Err(ProtocolError::TooManyBodies { .. })));
    }

    #[test]
    fn node_data_may_skip_but_not_reorder() {
        let values: Vec<Vec<u8>> = (0u8..4).map(|i| vec![i; 8]).collect();
        let hashes: Vec<_> = values.iter().map(|v| crypto::content_hash(v)).collect();

        let skipped = vec![values[0].clone(), values[2].clone()];
        assert_eq!(validate_node_data(&hashes, &skipped).unwrap(), vec![hashes[0], hashes[2]]);

        let reordered = vec![values[2].clone(), values[0].clone()];
        assert_eq!(
            validate_node_data(&hashes, &reordered),
            Err(ProtocolError::UnrequestedEntry { kind: "node data", index: 1 })
        );
        assert_eq!(validate_node_data(&hashes, &[]), Err(ProtocolError::EmptyReply("node data")));
    }

    #[test]
    fn receipts_must_match_roots() {
        let blocks = chain::chain(3);
        let hs: Vec<_> = blocks.iter().map(|b| b.header.clone()).collect();
        let lists: Vec<_> = blocks.iter().map(|b| chain::synthetic_receipts(&b.body)).collect();
        assert!(validate_receipts(&hs, &lists).is_ok());
        assert!(validate_receipts(&hs, &lists[..1]).is_ok());
        assert_eq!(validate_receipts(&hs, &[]), Err(ProtocolError::EmptyReply("receipts")));
        let wrong = vec![lists[1].clone()];
        assert_eq!(
            validate_receipts(&hs, &wrong),
            Err(ProtocolError::UnrequestedEntry { kind: "receipts", index: 0 })
        );
    }
}
