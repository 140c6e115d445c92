use zenith_mm::address::VAddr;
use zenith_mm::paging::FrameTable;

/// How swap-out victims are picked when the caller does not name one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacementPolicy {
    /// No automatic selection; callers must name the page.
    None,
    Lru,
    Fifo,
    Clock,
    Random,
}

/// Cursor and generator state the policies carry across calls.
pub struct PolicyState {
    clock_hand: usize,
    rng: u64,
}

impl PolicyState {
    pub const fn new() -> Self {
        Self {
            clock_hand: 0,
            rng: 0x9e37_79b9_7f4a_7c15,
        }
    }

    fn next_random(&mut self) -> u64 {
        // xorshift64
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng = x;
        x
    }
}

/// A resident page eligible for eviction, snapshotted under the mm lock.
#[derive(Debug, Clone, Copy)]
pub struct VictimCandidate {
    pub addr: VAddr,
    pub pfn: zenith_mm::paging::PFN,
    pub accessed: bool,
}

/// Pick a victim among `candidates` (sorted by address). `clear_accessed`
/// lets the clock sweep retire reference bits as it passes over pages.
pub fn select_victim(
    policy: ReplacementPolicy,
    state: &mut PolicyState,
    frames: &FrameTable,
    candidates: &[VictimCandidate],
    mut clear_accessed: impl FnMut(VAddr),
) -> Option<VAddr> {
    if candidates.is_empty() {
        return None;
    }

    match policy {
        ReplacementPolicy::None => None,
        ReplacementPolicy::Lru => candidates
            .iter()
            .min_by_key(|candidate| frames.frame(candidate.pfn).stamp())
            .map(|candidate| candidate.addr),
        ReplacementPolicy::Fifo => candidates
            .iter()
            .min_by_key(|candidate| frames.frame(candidate.pfn).birth())
            .map(|candidate| candidate.addr),
        ReplacementPolicy::Clock => {
            let start = candidates
                .iter()
                .position(|candidate| usize::from(candidate.addr) >= state.clock_hand)
                .unwrap_or(0);

            // Two sweeps: the first may clear every reference bit, the
            // second is then guaranteed to find a victim.
            for lap in 0..2 {
                for offset in 0..candidates.len() {
                    let candidate = &candidates[(start + offset) % candidates.len()];

                    if candidate.accessed && lap == 0 {
                        clear_accessed(candidate.addr);
                    } else {
                        state.clock_hand = usize::from(candidate.addr) + 1;
                        return Some(candidate.addr);
                    }
                }
            }
            unreachable!("second clock sweep always yields a victim");
        }
        ReplacementPolicy::Random => {
            let pick = state.next_random() as usize % candidates.len();
            Some(candidates[pick].addr)
        }
    }
}

/// What the classifier sees about a swap-out candidate.
#[derive(Debug, Clone, Copy)]
pub struct PageStats {
    pub age_ms: u64,
    pub executable: bool,
    pub shared: bool,
    pub dirty: bool,
}

#[derive(Clone, Copy)]
pub enum ClassifierKind {
    /// Recently touched pages are hot.
    AccessTime,
    /// Page role decides: executable and shared pages are hot.
    PageType,
    Custom(fn(&PageStats) -> u32),
}

/// Scores candidates 0..100; pages hotter than the watermark are skipped
/// by the out-path and surface `WouldBlock`.
pub struct PriorityClassifier {
    kind: ClassifierKind,
    watermark: u32,
}

pub const DEFAULT_SWAP_WATERMARK: u32 = 75;

impl PriorityClassifier {
    pub const fn new(kind: ClassifierKind) -> Self {
        Self {
            kind,
            watermark: DEFAULT_SWAP_WATERMARK,
        }
    }

    pub fn heat(&self, stats: &PageStats) -> u32 {
        match self.kind {
            ClassifierKind::AccessTime => (100 / (1 + stats.age_ms / 1000)) as u32,
            ClassifierKind::PageType => {
                if stats.executable {
                    90
                } else if stats.shared {
                    70
                } else if stats.dirty {
                    50
                } else {
                    20
                }
            }
            ClassifierKind::Custom(score) => score(stats).min(100),
        }
    }

    pub fn allows(&self, stats: &PageStats) -> bool {
        self.heat(stats) <= self.watermark
    }

    pub fn watermark(&self) -> u32 {
        self.watermark
    }

    pub fn set_watermark(&mut self, watermark: u32) {
        self.watermark = watermark.min(100);
    }

    pub fn set_kind(&mut self, kind: ClassifierKind) {
        self.kind = kind;
    }

    /// Pressure-driven re-tune: admit only colder pages.
    pub fn tighten(&mut self) {
        self.watermark = self.watermark.saturating_sub(10).max(10);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zenith_mm::paging::{FrameTable, PFN};

    fn candidates(frames: &FrameTable) -> alloc::vec::Vec<VictimCandidate> {
        (0..4)
            .map(|i| {
                let pfn = PFN::from_val(i);
                frames.frame(pfn).born(100 - i as u64 * 10);
                frames.frame(pfn).touch(100 + i as u64 * 10);
                VictimCandidate {
                    addr: VAddr::from(0x1000 * (i + 1)),
                    pfn,
                    accessed: false,
                }
            })
            .collect()
    }

    #[test]
    fn lru_picks_the_stalest_page() {
        let frames = FrameTable::new(PFN::from_val(0), 4);
        let candidates = candidates(&frames);
        let mut state = PolicyState::new();

        // touch stamps ascend with the index, so the first page is stalest.
        let victim = select_victim(
            ReplacementPolicy::Lru,
            &mut state,
            &frames,
            &candidates,
            |_| {},
        );
        assert_eq!(victim, Some(VAddr::from(0x1000)));
    }

    #[test]
    fn fifo_picks_the_oldest_mapping() {
        let frames = FrameTable::new(PFN::from_val(0), 4);
        let candidates = candidates(&frames);
        let mut state = PolicyState::new();

        // birth stamps descend with the index, so the last page is oldest.
        let victim = select_victim(
            ReplacementPolicy::Fifo,
            &mut state,
            &frames,
            &candidates,
            |_| {},
        );
        assert_eq!(victim, Some(VAddr::from(0x4000)));
    }

    #[test]
    fn clock_skips_referenced_pages_once() {
        let frames = FrameTable::new(PFN::from_val(0), 4);
        let mut candidates = candidates(&frames);
        candidates[0].accessed = true;
        candidates[1].accessed = true;

        let mut cleared = alloc::vec::Vec::new();
        let mut state = PolicyState::new();
        let victim = select_victim(
            ReplacementPolicy::Clock,
            &mut state,
            &frames,
            &candidates,
            |addr| cleared.push(addr),
        );

        assert_eq!(victim, Some(VAddr::from(0x3000)));
        assert_eq!(cleared, alloc::vec![VAddr::from(0x1000), VAddr::from(0x2000)]);
    }

    #[test]
    fn none_policy_never_selects() {
        let frames = FrameTable::new(PFN::from_val(0), 4);
        let candidates = candidates(&frames);
        let mut state = PolicyState::new();

        let victim = select_victim(
            ReplacementPolicy::None,
            &mut state,
            &frames,
            &candidates,
            |_| {},
        );
        assert_eq!(victim, None);
    }

    #[test]
    fn classifier_kinds_score_differently() {
        let classifier = PriorityClassifier::new(ClassifierKind::AccessTime);
        let hot = PageStats {
            age_ms: 0,
            executable: false,
            shared: false,
            dirty: false,
        };
        let cold = PageStats { age_ms: 60_000, ..hot };

        assert!(classifier.heat(&hot) > classifier.heat(&cold));
        assert!(!classifier.allows(&hot));
        assert!(classifier.allows(&cold));

        let classifier = PriorityClassifier::new(ClassifierKind::PageType);
        let exec = PageStats {
            executable: true,
            ..hot
        };
        assert_eq!(classifier.heat(&exec), 90);

        let mut classifier = PriorityClassifier::new(ClassifierKind::PageType);
        classifier.tighten();
        assert_eq!(classifier.watermark(), DEFAULT_SWAP_WATERMARK - 10);
    }
}
