//! Header/block reconstruction window.
//!
//! Holds every header candidate received for a sliding range of block numbers,
//! grouped into generations (one per number). The best known chain is never
//! stored; it is recomputed by walking forward from the single settled
//! ancestor at `dark_zone_num`, keeping only candidates whose parent survived
//! the previous step. Parent and child links are resolved by lookup in the
//! neighbouring generation, so pruning a generation can never leave a stale
//! reference behind.
//!
//! The window is a plain `&mut self` structure; owners that share it between
//! tasks wrap it in a mutex of their own.

use std::collections::BTreeMap;

use keel_core::error::{StoreError, WindowError};
use keel_core::traits::BlockStore;
use keel_core::types::{Block, BlockBody, BlockHeader, Hash256};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, trace};

use crate::config::WindowConfig;
use crate::request::{BlocksRequest, HeadersRequest};

/// One received header, plus its body once downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderCandidate {
    header: BlockHeader,
    hash: Hash256,
    body: Option<BlockBody>,
    exported: bool,
}

impl HeaderCandidate {
    fn new(header: BlockHeader, hash: Hash256) -> Self {
        Self {
            header,
            hash,
            body: None,
            exported: false,
        }
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn hash(&self) -> Hash256 {
        self.hash
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn body(&self) -> Option<&BlockBody> {
        self.body.as_ref()
    }

    pub fn is_exported(&self) -> bool {
        self.exported
    }

    fn to_block(&self) -> Option<Block> {
        self.body.as_ref().map(|body| Block {
            header: self.header.clone(),
            body: body.clone(),
        })
    }
}

/// Candidates sharing one block number, ordered by hash.
pub type Generation = BTreeMap<Hash256, HeaderCandidate>;

/// All generations, ordered by block number.
pub type Generations = BTreeMap<u64, Generation>;

/// The parent of `candidate`, looked up in the generation one below.
pub fn parent_of<'a>(generations: &'a Generations, candidate: &HeaderCandidate) -> Option<&'a HeaderCandidate> {
    let number = candidate.number().checked_sub(1)?;
    generations.get(&number)?.get(&candidate.header.parent_hash)
}

/// The children of `candidate`, found by scanning the generation one above.
pub fn children_of<'a>(
    generations: &'a Generations,
    candidate: &'a HeaderCandidate,
) -> impl Iterator<Item = &'a HeaderCandidate> {
    let parent = candidate.hash;
    candidate
        .number()
        .checked_add(1)
        .and_then(|n| generations.get(&n))
        .into_iter()
        .flat_map(|generation| generation.values())
        .filter(move |c| c.header.parent_hash == parent)
}

/// Multi-generation reconstruction window.
pub struct SyncWindow {
    config: WindowConfig,
    generations: Generations,
    /// Lowest number still tracked.
    min_num: u64,
    /// Highest number seen.
    max_num: u64,
    /// Highest settled number. Its generation always holds exactly one candidate.
    dark_zone_num: u64,
    /// Ceiling for bounded downloads.
    end_block_number: Option<u64>,
    /// Highest number exported so far.
    last_exported: u64,
    rng: StdRng,
}

impl SyncWindow {
    /// Seed the window with an already trusted chain.
    ///
    /// The chain must link, and must either start at genesis or be at least
    /// `window_size` blocks long. Seed blocks count as exported.
    pub fn new(config: WindowConfig, init_blocks: Vec<Block>) -> Result<Self, WindowError> {
        let first = init_blocks.first().ok_or(WindowError::EmptyInitChain)?;
        if init_blocks.len() < config.window_size && !first.header.is_genesis() {
            return Err(WindowError::ShortInitChain {
                len: init_blocks.len(),
                min: config.window_size,
            });
        }
        for pair in init_blocks.windows(2) {
            let (parent, child) = (&pair[0], &pair[1]);
            if child.header.parent_hash != parent.hash() || child.number() != parent.number() + 1 {
                return Err(WindowError::UnlinkedInitChain {
                    number: child.number(),
                });
            }
        }

        let first_num = first.number();
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut window = Self {
            config,
            generations: Generations::new(),
            min_num: first_num,
            max_num: first_num,
            dark_zone_num: first_num,
            end_block_number: None,
            last_exported: first_num,
            rng,
        };

        for block in init_blocks {
            let hash = block.hash();
            let number = block.number();
            let mut candidate = HeaderCandidate::new(block.header, hash);
            candidate.body = Some(block.body);
            candidate.exported = true;
            window.generations.entry(number).or_default().insert(hash, candidate);
            window.max_num = window.max_num.max(number);
            window.last_exported = window.last_exported.max(number);
        }
        window.trim_chain();

        info!(
            min = window.min_num,
            settled = window.dark_zone_num,
            max = window.max_num,
            "window: initialized"
        );
        Ok(window)
    }

    /// Seed the window from the top of the local chain, optionally bounding
    /// the download at `end_block_number`.
    pub fn from_store(
        config: WindowConfig,
        store: &dyn BlockStore,
        end_block_number: Option<u64>,
    ) -> Result<Self, WindowError> {
        let best = store.best_block()?;
        let start = best.number().saturating_sub(config.window_size as u64);
        let mut blocks = Vec::with_capacity((best.number() - start + 1) as usize);
        for number in start..=best.number() {
            let block = store
                .block_by_number(number)?
                .ok_or_else(|| StoreError::NotFound(format!("block {number}")))?;
            blocks.push(block);
        }
        let mut window = Self::new(config, blocks)?;
        window.end_block_number = end_block_number;
        Ok(window)
    }

    /// Bound the download: headers above `end` are ignored from now on.
    pub fn set_end_block_number(&mut self, end: Option<u64>) {
        self.end_block_number = end;
    }

    pub fn min_num(&self) -> u64 {
        self.min_num
    }

    pub fn max_num(&self) -> u64 {
        self.max_num
    }

    pub fn dark_zone_num(&self) -> u64 {
        self.dark_zone_num
    }

    pub fn end_block_number(&self) -> Option<u64> {
        self.end_block_number
    }

    pub fn last_exported_num(&self) -> u64 {
        self.last_exported
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    pub fn generations(&self) -> &Generations {
        &self.generations
    }

    /// Candidate with `hash` at `number`, if tracked.
    pub fn candidate(&self, number: u64, hash: &Hash256) -> Option<&HeaderCandidate> {
        self.generations.get(&number)?.get(hash)
    }

    /// Number of candidates currently buffered across all generations.
    pub fn headers_count(&self) -> usize {
        self.generations.values().map(|g| g.len()).sum()
    }

    /// Whether a bounded download has exported its last block.
    pub fn is_complete(&self) -> bool {
        self.end_block_number.is_some_and(|end| self.last_exported >= end)
    }

    /// Add one header. Returns `true` if it was not known before.
    ///
    /// Settled, far-ahead and out-of-bound headers are dropped silently.
    pub fn add_header(&mut self, header: BlockHeader) -> bool {
        let number = header.number;
        if number <= self.dark_zone_num {
            trace!(number, settled = self.dark_zone_num, "window: dropping settled header");
            return false;
        }
        if number > self.config.horizon(self.max_num) {
            debug!(number, max = self.max_num, "window: dropping far-ahead header");
            return false;
        }
        if self.end_block_number.is_some_and(|end| number > end) {
            return false;
        }

        let hash = header.hash();
        let generation = self.generations.entry(number).or_default();
        if generation.contains_key(&hash) {
            return false;
        }
        generation.insert(hash, HeaderCandidate::new(header, hash));
        self.min_num = self.min_num.min(number);
        self.max_num = self.max_num.max(number);
        true
    }

    /// Add a batch of headers, then settle the window. Returns the number of
    /// new candidates.
    pub fn add_headers(&mut self, headers: Vec<BlockHeader>) -> usize {
        let received = headers.len();
        let added = headers
            .into_iter()
            .map(|h| self.add_header(h))
            .filter(|added| *added)
            .count();
        self.trim_chain();
        debug!(received, added, max = self.max_num, "window: headers added");
        added
    }

    /// The settled candidate at `dark_zone_num`.
    fn settled(&self) -> Option<&HeaderCandidate> {
        self.generations.get(&self.dark_zone_num)?.values().next()
    }

    /// The best known chain, from the settled ancestor up to the highest
    /// candidate reachable through parent links.
    ///
    /// When several candidates reach the same height the one with the lowest
    /// hash is the tip, so identical windows always yield identical chains.
    pub fn longest_chain(&self) -> Vec<&HeaderCandidate> {
        let Some(settled) = self.settled() else {
            return Vec::new();
        };

        let mut frontier: Vec<&HeaderCandidate> = vec![settled];
        loop {
            let next: Vec<&HeaderCandidate> = frontier
                .iter()
                .copied()
                .flat_map(|parent| children_of(&self.generations, parent))
                .collect();
            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        let Some(mut current) = frontier.into_iter().min_by_key(|c| c.hash) else {
            return Vec::new();
        };
        let mut chain = vec![current];
        while current.number() > self.dark_zone_num {
            match parent_of(&self.generations, current) {
                Some(parent) => {
                    chain.push(parent);
                    current = parent;
                }
                None => break,
            }
        }
        chain.reverse();
        chain
    }

    /// Whether headers exist above the longest chain's tip that cannot yet
    /// be linked to it.
    pub fn has_gaps(&self) -> bool {
        self.longest_chain()
            .last()
            .is_some_and(|tip| tip.number() < self.max_num)
    }

    /// Settle everything more than `window_size` below the longest chain's
    /// tip, collapsing each newly settled generation to the candidate on the
    /// kept path.
    pub fn trim_chain(&mut self) {
        let chain: Vec<(u64, Hash256)> = self
            .longest_chain()
            .iter()
            .map(|c| (c.number(), c.hash))
            .collect();
        let window = self.config.window_size;
        if chain.len() <= window {
            return;
        }

        let settle_upto = chain.len() - window;
        let new_dark = chain[settle_upto].0;
        let mut pruned_forks = 0;
        for &(number, hash) in &chain[1..=settle_upto] {
            if let Some(generation) = self.generations.get_mut(&number) {
                let before = generation.len();
                generation.retain(|h, _| *h == hash);
                pruned_forks += before - generation.len();
            }
        }
        debug!(
            from = self.dark_zone_num,
            to = new_dark,
            pruned_forks,
            "window: settled generations"
        );
        self.dark_zone_num = new_dark;
        self.prune_exported();
    }

    /// Drop settled generations whose single candidate has been exported.
    fn prune_exported(&mut self) {
        while self.min_num < self.dark_zone_num {
            let done = self
                .generations
                .get(&self.min_num)
                .is_some_and(|g| g.len() == 1 && g.values().all(|c| c.exported));
            if !done {
                break;
            }
            self.generations.remove(&self.min_num);
            self.min_num += 1;
        }
    }

    /// Header requests needed to extend the window.
    ///
    /// With a gap above the longest chain's tip a single request covering
    /// the numbers just above the tip is returned, walking forward or
    /// backward at random. The gap request ignores backpressure.
    ///
    /// Otherwise up to `max_requests` consecutive requests of `max_size`
    /// headers follow `max_num`, none while `max_total_headers` or more
    /// candidates are buffered.
    pub fn request_headers(
        &mut self,
        max_size: usize,
        max_requests: usize,
        max_total_headers: usize,
    ) -> Vec<HeadersRequest> {
        if self.has_gaps() {
            let tip = self
                .longest_chain()
                .last()
                .map(|c| c.number())
                .unwrap_or(self.dark_zone_num);
            let mut top = tip.saturating_add(self.config.window_size as u64);
            if let Some(end) = self.end_block_number {
                top = top.min(end);
            }
            let count = (top - tip) as usize;
            if count == 0 {
                return Vec::new();
            }
            let request = if self.rng.gen_bool(0.5) {
                HeadersRequest::backward(top, count)
            } else {
                HeadersRequest::forward(tip + 1, count)
            };
            debug!(tip, max = self.max_num, %request, "window: requesting gap");
            return vec![request];
        }

        let buffered = self.headers_count();
        if max_size == 0 || max_requests == 0 || buffered >= max_total_headers {
            return Vec::new();
        }
        let mut budget = max_total_headers - buffered;
        // No generation exists above `max_num`, so the run is contiguous.
        let mut start = self.max_num.saturating_add(1);
        let mut requests = Vec::new();
        while requests.len() < max_requests && budget > 0 {
            if self.end_block_number.is_some_and(|end| start > end) {
                break;
            }
            let mut count = max_size.min(budget);
            if let Some(end) = self.end_block_number {
                count = count.min((end - start + 1) as usize);
            }
            requests.push(HeadersRequest::forward(start, count));
            budget -= count;
            start += count as u64;
        }
        requests
    }

    /// Headers of candidates still missing a body, lowest numbers first.
    pub fn request_blocks(&self, max_size: usize) -> BlocksRequest {
        let headers = self
            .generations
            .range(self.min_num..)
            .flat_map(|(_, generation)| generation.values())
            .filter(|c| c.body.is_none() && !c.exported)
            .take(max_size)
            .map(|c| c.header.clone())
            .collect();
        BlocksRequest::new(headers)
    }

    /// Attach downloaded bodies, then export whatever became exportable.
    ///
    /// Bodies for unknown headers, or not matching their header, are ignored.
    pub fn add_blocks(&mut self, blocks: Vec<Block>) -> Vec<Block> {
        let mut attached = 0;
        for block in blocks {
            let hash = block.hash();
            let Some(candidate) = self
                .generations
                .get_mut(&block.number())
                .and_then(|g| g.get_mut(&hash))
            else {
                trace!(number = block.number(), hash = %hash.short(), "window: body for unknown header");
                continue;
            };
            if !block.body.matches(&block.header) {
                debug!(number = block.number(), "window: body does not match header");
                continue;
            }
            if candidate.body.is_none() {
                candidate.body = Some(block.body);
                attached += 1;
            }
        }
        trace!(attached, "window: bodies attached");
        self.export_blocks()
    }

    /// Export blocks in ascending, gap-free order.
    ///
    /// Walking up from `min_num`, every candidate with a body whose parent is
    /// exported (or which sits at `min_num`) is marked exported and returned.
    /// The walk stops at the first generation with nothing exportable.
    pub fn export_blocks(&mut self) -> Vec<Block> {
        let mut exported = Vec::new();
        let mut number = self.min_num;
        loop {
            let Some(generation) = self.generations.get(&number) else {
                break;
            };
            let mut any = false;
            let mut ready = Vec::new();
            for (hash, candidate) in generation {
                if candidate.body.is_none() {
                    continue;
                }
                let parent_exported = number == self.min_num
                    || parent_of(&self.generations, candidate).is_some_and(|p| p.exported);
                if parent_exported {
                    any = true;
                    if !candidate.exported {
                        ready.push(*hash);
                    }
                }
            }
            if !any {
                break;
            }
            if let Some(generation) = self.generations.get_mut(&number) {
                for hash in ready {
                    if let Some(candidate) = generation.get_mut(&hash) {
                        candidate.exported = true;
                        if let Some(block) = candidate.to_block() {
                            exported.push(block);
                        }
                    }
                }
            }
            self.last_exported = self.last_exported.max(number);
            number += 1;
        }
        self.prune_exported();
        if let (Some(first), Some(last)) = (exported.first(), exported.last()) {
            debug!(
                count = exported.len(),
                from = first.number(),
                to = last.number(),
                "window: exported blocks"
            );
        }
        exported
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::chain;
    use keel_core::types::HeaderAnchor;

    fn window_on(blocks: Vec<Block>, window_size: usize) -> SyncWindow {
        let config = WindowConfig {
            window_size,
            rng_seed: Some(7),
            ..WindowConfig::default()
        };
        SyncWindow::new(config, blocks).unwrap()
    }

    fn headers(blocks: &[Block]) -> Vec<BlockHeader> {
        blocks.iter().map(|b| b.header.clone()).collect()
    }

    fn tip_number(w: &SyncWindow) -> u64 {
        w.longest_chain().last().unwrap().number()
    }

    #[test]
    fn short_seed_must_start_at_genesis() {
        let blocks = chain::chain(20);
        let err = SyncWindow::new(WindowConfig::default(), blocks[5..].to_vec()).err();
        assert_eq!(err, Some(WindowError::ShortInitChain { len: 15, min: 192 }));
        assert!(SyncWindow::new(WindowConfig::default(), blocks).is_ok());
    }

    #[test]
    fn seed_must_link() {
        let mut blocks = chain::chain(5);
        blocks.remove(2);
        let err = SyncWindow::new(WindowConfig::default(), blocks).err();
        assert_eq!(err, Some(WindowError::UnlinkedInitChain { number: 3 }));
        assert_eq!(
            SyncWindow::new(WindowConfig::default(), Vec::new()).err(),
            Some(WindowError::EmptyInitChain)
        );
    }

    #[test]
    fn add_header_is_idempotent() {
        let blocks = chain::chain(10);
        let mut w = window_on(blocks[..5].to_vec(), 192);
        assert!(w.add_header(blocks[5].header.clone()));
        assert!(!w.add_header(blocks[5].header.clone()));
        assert_eq!(w.max_num(), 5);
        assert_eq!(w.headers_count(), 6);
    }

    #[test]
    fn settled_and_far_ahead_headers_are_dropped() {
        let blocks = chain::chain(5);
        let mut w = window_on(blocks.clone(), 2);
        assert!(w.dark_zone_num() > 0);
        assert!(!w.add_header(blocks[1].header.clone()));

        let mut far = blocks[4].header.clone();
        far.number = w.max_num() + 2 * 128 + 1;
        assert!(!w.add_header(far.clone()));
        far.number -= 1;
        assert!(w.add_header(far));
    }

    #[test]
    fn end_block_number_bounds_headers() {
        let blocks = chain::chain(10);
        let mut w = window_on(blocks[..4].to_vec(), 192);
        w.set_end_block_number(Some(5));
        assert_eq!(w.add_headers(headers(&blocks[4..])), 2);
        assert_eq!(w.max_num(), 5);
    }

    #[test]
    fn longest_chain_follows_parent_links() {
        let blocks = chain::chain(10);
        let mut w = window_on(blocks[..3].to_vec(), 192);
        w.add_headers(headers(&blocks[3..]));
        let chain = w.longest_chain();
        assert_eq!(chain.len(), 10);
        for pair in chain.windows(2) {
            assert_eq!(pair[1].header().parent_hash, pair[0].hash());
        }
        assert!(!w.has_gaps());
    }

    #[test]
    fn gap_stops_the_walk() {
        let blocks = chain::chain(10);
        let mut w = window_on(blocks[..3].to_vec(), 192);
        w.add_headers(headers(&blocks[3..5]));
        w.add_headers(headers(&blocks[7..]));
        assert_eq!(tip_number(&w), 4);
        assert!(w.has_gaps());

        w.add_headers(headers(&blocks[5..7]));
        assert_eq!(tip_number(&w), 9);
        assert!(!w.has_gaps());
    }

    #[test]
    fn longer_fork_wins() {
        let base = chain::chain(4);
        let mut w = window_on(base.clone(), 192);
        let a = chain::extend(&base[3].header, 2, 1);
        let b = chain::extend(&base[3].header, 4, 2);
        w.add_headers(headers(&a));
        w.add_headers(headers(&b));
        let chain = w.longest_chain();
        assert_eq!(chain.last().unwrap().hash(), b[3].hash());
    }

    #[test]
    fn equal_forks_resolve_deterministically() {
        let base = chain::chain(4);
        let a = chain::extend(&base[3].header, 3, 1);
        let b = chain::extend(&base[3].header, 3, 2);

        let mut w1 = window_on(base.clone(), 192);
        w1.add_headers(headers(&a));
        w1.add_headers(headers(&b));
        let mut w2 = window_on(base, 192);
        w2.add_headers(headers(&b));
        w2.add_headers(headers(&a));

        let c1: Vec<_> = w1.longest_chain().iter().map(|c| c.hash()).collect();
        let c2: Vec<_> = w2.longest_chain().iter().map(|c| c.hash()).collect();
        assert_eq!(c1, c2);
        let expected_tip = a[2].hash().min(b[2].hash());
        assert_eq!(*c1.last().unwrap(), expected_tip);
    }

    #[test]
    fn children_are_found_by_scanning_the_next_generation() {
        let base = chain::chain(3);
        let mut w = window_on(base.clone(), 192);
        let a = chain::block_on(&base[2].header, 1);
        let b = chain::block_on(&base[2].header, 2);
        w.add_headers(vec![a.header.clone(), b.header.clone()]);
        let parent = w.candidate(2, &base[2].hash()).unwrap();
        assert_eq!(children_of(w.generations(), parent).count(), 2);
        let child = w.candidate(3, &a.hash()).unwrap();
        assert_eq!(parent_of(w.generations(), child).unwrap().hash(), base[2].hash());
    }

    #[test]
    fn trim_settles_and_collapses_forks() {
        let base = chain::chain(3);
        let mut w = window_on(base.clone(), 4);
        let main = chain::extend(&base[2].header, 6, 0);
        let fork = chain::extend(&base[2].header, 2, 9);
        w.add_headers(headers(&fork));
        w.add_headers(headers(&main));

        // Longest chain ran 1..=8; it is cut back to four generations.
        assert_eq!(w.dark_zone_num(), 5);
        assert_eq!(w.generations()[&3].len(), 1);
        assert_eq!(w.generations()[&4].len(), 1);
        assert_eq!(w.generations()[&5].len(), 1);
        assert!(w.candidate(3, &fork[0].hash()).is_none());
        assert_eq!(w.longest_chain().len(), 4);
    }

    #[test]
    fn request_headers_sequential() {
        let blocks = chain::chain(3);
        let mut w = window_on(blocks, 192);
        let reqs = w.request_headers(10, 3, 1000);
        assert_eq!(
            reqs,
            vec![
                HeadersRequest::forward(3, 10),
                HeadersRequest::forward(13, 10),
                HeadersRequest::forward(23, 10),
            ]
        );
    }

    #[test]
    fn request_headers_applies_backpressure() {
        let blocks = chain::chain(3);
        let mut w = window_on(blocks, 192);
        assert!(w.request_headers(10, 3, 3).is_empty());
        let reqs = w.request_headers(10, 3, 18);
        assert_eq!(reqs, vec![HeadersRequest::forward(3, 10), HeadersRequest::forward(13, 5)]);
    }

    #[test]
    fn request_headers_respects_end_block() {
        let blocks = chain::chain(3);
        let mut w = window_on(blocks, 192);
        w.set_end_block_number(Some(14));
        let reqs = w.request_headers(10, 5, 1000);
        assert_eq!(reqs, vec![HeadersRequest::forward(3, 10), HeadersRequest::forward(13, 2)]);
    }

    #[test]
    fn request_headers_closes_gap_first() {
        let blocks = chain::chain(20);
        let mut w = window_on(blocks[..3].to_vec(), 8);
        w.add_headers(headers(&blocks[15..]));
        assert!(w.has_gaps());
        for _ in 0..10 {
            let reqs = w.request_headers(10, 3, 1000);
            assert_eq!(reqs.len(), 1);
            let (lo, hi) = reqs[0].range().unwrap();
            assert_eq!((lo, hi), (3, 10));
            if reqs[0].reverse {
                assert_eq!(reqs[0].anchor, HeaderAnchor::Number(10));
            }
        }
    }

    #[test]
    fn gap_is_requested_even_when_the_buffer_is_full() {
        let blocks = chain::chain(60);
        let mut w = window_on(blocks[..3].to_vec(), 8);
        w.add_headers(headers(&blocks[10..]));
        assert!(w.has_gaps());
        assert!(w.headers_count() >= 40);

        let reqs = w.request_headers(10, 3, 40);
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].range(), Some((3, 10)));

        // Closing the gap lets the window settle and drain.
        w.add_headers(headers(&blocks[3..10]));
        assert!(!w.has_gaps());
        assert_eq!(w.dark_zone_num(), 52);
    }

    #[test]
    fn request_blocks_lists_missing_bodies() {
        let blocks = chain::chain(10);
        let mut w = window_on(blocks[..3].to_vec(), 192);
        w.add_headers(headers(&blocks[3..]));
        let req = w.request_blocks(4);
        let numbers: Vec<_> = req.headers.iter().map(|h| h.number).collect();
        assert_eq!(numbers, vec![3, 4, 5, 6]);
    }

    #[test]
    fn export_stops_at_missing_body() {
        let blocks = chain::chain(9);
        let mut w = window_on(blocks[..5].to_vec(), 192);
        w.add_headers(headers(&blocks[5..]));

        let exported = w.add_blocks(vec![blocks[5].clone(), blocks[6].clone(), blocks[8].clone()]);
        let numbers: Vec<_> = exported.iter().map(|b| b.number()).collect();
        assert_eq!(numbers, vec![5, 6]);
        assert!(!w.candidate(8, &blocks[8].hash()).unwrap().is_exported());

        let exported = w.add_blocks(vec![blocks[7].clone()]);
        let numbers: Vec<_> = exported.iter().map(|b| b.number()).collect();
        assert_eq!(numbers, vec![7, 8]);
    }

    #[test]
    fn mismatched_bodies_are_ignored() {
        let blocks = chain::chain(6);
        let mut w = window_on(blocks[..5].to_vec(), 192);
        w.add_headers(headers(&blocks[5..]));
        let mut forged = blocks[5].clone();
        forged.body = BlockBody(vec![0xFF]);
        assert!(w.add_blocks(vec![forged]).is_empty());
        assert_eq!(w.request_blocks(10).len(), 1);
    }

    #[test]
    fn export_prunes_settled_generations() {
        let blocks = chain::chain(12);
        let mut w = window_on(blocks[..3].to_vec(), 4);
        w.add_headers(headers(&blocks[3..]));
        assert_eq!(w.dark_zone_num(), 8);
        assert_eq!(w.min_num(), 3);

        w.add_blocks(blocks[3..9].to_vec());
        assert_eq!(w.min_num(), 8);
        assert!(w.min_num() <= w.dark_zone_num());
        assert!(!w.generations().contains_key(&7));
        assert_eq!(w.last_exported_num(), 8);
    }

    #[test]
    fn bounded_download_completes() {
        let blocks = chain::chain(8);
        let mut w = window_on(blocks[..3].to_vec(), 192);
        w.set_end_block_number(Some(7));
        assert!(!w.is_complete());
        w.add_headers(headers(&blocks[3..]));
        w.add_blocks(blocks[3..].to_vec());
        assert!(w.is_complete());
    }
}
