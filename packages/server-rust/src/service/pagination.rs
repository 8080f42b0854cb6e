//! Pagination state machine.
//!
//! [`PaginationState`] is an immutable cursor: the driver consumes one page's
//! `extra_data` and returns the next state, or the reason to stop. Pages of a
//! single Sr are strictly sequential since each cursor depends on the
//! previous page's metadata.

use opflow_core::context::{keys, value_as_u64};
use opflow_core::model::response_key_names;
use opflow_core::{PaginationType, QueryContext};
use serde_json::{Map, Value};

/// Cursor for one Sr within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationState {
    pub kind: PaginationType,
    pub offset: u64,
    pub page_number: u64,
    pub page_size: u64,
    pub total_items: Option<u64>,
    pub total_pages: Option<u64>,
    /// Pages already requested for this Sr in the run.
    pub pages_fetched: u32,
}

impl PaginationState {
    /// Seeds the cursor from the invocation context: `offset` defaults to 0,
    /// `page_number` to 1 and `page_size` to `default_page_size`.
    #[must_use]
    pub fn seed(kind: PaginationType, ctx: &QueryContext, default_page_size: u64) -> Self {
        Self {
            kind,
            offset: ctx.get_u64(keys::OFFSET).unwrap_or(0),
            page_number: ctx.get_u64(keys::PAGE_NUMBER).unwrap_or(1),
            page_size: ctx.get_u64(keys::PAGE_SIZE).unwrap_or(default_page_size),
            total_items: None,
            total_pages: None,
            pages_fetched: 0,
        }
    }

    /// Writes the cursor into the context the next request resolves against.
    pub fn apply_to(&self, ctx: &mut QueryContext) {
        match self.kind {
            PaginationType::None => {}
            PaginationType::Offset => {
                ctx.insert(keys::OFFSET, self.offset);
                ctx.insert(keys::PAGE_SIZE, self.page_size);
            }
            PaginationType::Page => {
                ctx.insert(keys::PAGE_NUMBER, self.page_number);
                ctx.insert(keys::PAGE_SIZE, self.page_size);
            }
        }
    }
}

/// Why pagination ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    NotPaginated,
    /// The next cursor is past the reported total.
    Exhausted,
    /// The response carried no usable total.
    MissingTotal,
    /// Page size was zero.
    InvalidPageSize,
    /// The configured page cap was reached.
    CapReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageDecision {
    Continue(PaginationState),
    Stop(StopReason),
}

/// Decides the next page from the current cursor and a page's `extra_data`.
#[derive(Debug, Clone, Copy)]
pub struct PaginationDriver {
    max_pages: u32,
}

impl PaginationDriver {
    #[must_use]
    pub fn new(max_pages: u32) -> Self {
        Self { max_pages }
    }

    /// Called once after a full page was processed.
    #[must_use]
    pub fn next(&self, state: &PaginationState, extra: &Map<String, Value>) -> PageDecision {
        let fetched = state.pages_fetched.saturating_add(1);
        let read = |name: &str| extra.get(name).and_then(value_as_u64);
        let page_size = read(keys::PAGE_SIZE).unwrap_or(state.page_size);

        let next = match state.kind {
            PaginationType::None => return PageDecision::Stop(StopReason::NotPaginated),
            PaginationType::Offset => {
                let current = read(keys::OFFSET).unwrap_or(state.offset);
                let Some(total) = read(response_key_names::TOTAL_ITEMS).or(state.total_items) else {
                    return PageDecision::Stop(StopReason::MissingTotal);
                };
                if page_size == 0 {
                    return PageDecision::Stop(StopReason::InvalidPageSize);
                }
                let offset = current.saturating_add(page_size);
                if offset >= total {
                    return PageDecision::Stop(StopReason::Exhausted);
                }
                PaginationState {
                    offset,
                    page_size,
                    total_items: Some(total),
                    pages_fetched: fetched,
                    ..*state
                }
            }
            PaginationType::Page => {
                let current = read(keys::PAGE_NUMBER).unwrap_or(state.page_number);
                let Some(total) = read(response_key_names::TOTAL_PAGES).or(state.total_pages) else {
                    return PageDecision::Stop(StopReason::MissingTotal);
                };
                let page_number = current.saturating_add(1);
                if page_number > total {
                    return PageDecision::Stop(StopReason::Exhausted);
                }
                PaginationState {
                    page_number,
                    page_size,
                    total_pages: Some(total),
                    pages_fetched: fetched,
                    ..*state
                }
            }
        };

        if fetched >= self.max_pages {
            return PageDecision::Stop(StopReason::CapReached);
        }
        PageDecision::Continue(next)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn extra(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    /// Drives a cursor to completion with a fixed response and records the
    /// cursor each request was made with.
    fn drive(
        driver: PaginationDriver,
        mut state: PaginationState,
        page_extra: &Map<String, Value>,
    ) -> (Vec<PaginationState>, StopReason) {
        let mut seen = Vec::new();
        loop {
            seen.push(state);
            match driver.next(&state, page_extra) {
                PageDecision::Continue(next) => state = next,
                PageDecision::Stop(reason) => return (seen, reason),
            }
        }
    }

    #[test]
    fn offset_pagination_walks_to_total() {
        let state = PaginationState::seed(PaginationType::Offset, &QueryContext::new(), 100);
        let (seen, reason) = drive(
            PaginationDriver::new(100),
            state,
            &extra(&[("total_items", json!(250))]),
        );
        let offsets: Vec<u64> = seen.iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![0, 100, 200]);
        assert_eq!(reason, StopReason::Exhausted);
    }

    #[test]
    fn page_pagination_walks_to_total_pages() {
        let state = PaginationState::seed(PaginationType::Page, &QueryContext::new(), 20);
        let (seen, reason) = drive(
            PaginationDriver::new(100),
            state,
            &extra(&[("total_pages", json!("3"))]),
        );
        let pages: Vec<u64> = seen.iter().map(|s| s.page_number).collect();
        assert_eq!(pages, vec![1, 2, 3]);
        assert_eq!(reason, StopReason::Exhausted);
    }

    #[test]
    fn explicit_offset_in_response_is_adopted() {
        let state = PaginationState::seed(PaginationType::Offset, &QueryContext::new(), 10);
        let decision = PaginationDriver::new(100).next(
            &state,
            &extra(&[("offset", json!(40)), ("total_items", json!(100))]),
        );
        match decision {
            PageDecision::Continue(next) => assert_eq!(next.offset, 50),
            PageDecision::Stop(r) => panic!("unexpected stop: {r:?}"),
        }
    }

    #[test]
    fn missing_total_stops_instead_of_guessing() {
        let state = PaginationState::seed(PaginationType::Offset, &QueryContext::new(), 10);
        assert_eq!(
            PaginationDriver::new(100).next(&state, &Map::new()),
            PageDecision::Stop(StopReason::MissingTotal)
        );
        let state = PaginationState::seed(PaginationType::Page, &QueryContext::new(), 10);
        assert_eq!(
            PaginationDriver::new(100).next(&state, &extra(&[("total_pages", json!("n/a"))])),
            PageDecision::Stop(StopReason::MissingTotal)
        );
    }

    #[test]
    fn zero_page_size_stops() {
        let state = PaginationState::seed(PaginationType::Offset, &QueryContext::new(), 0);
        assert_eq!(
            PaginationDriver::new(100).next(&state, &extra(&[("total_items", json!(5))])),
            PageDecision::Stop(StopReason::InvalidPageSize)
        );
    }

    #[test]
    fn cap_bounds_runaway_totals() {
        let state = PaginationState::seed(PaginationType::Page, &QueryContext::new(), 1);
        let (seen, reason) = drive(
            PaginationDriver::new(5),
            state,
            &extra(&[("total_pages", json!(1_000_000))]),
        );
        assert_eq!(seen.len(), 5);
        assert_eq!(reason, StopReason::CapReached);
    }

    #[test]
    fn seed_and_apply_round_trip_through_context() {
        let ctx = QueryContext::new().with_value("offset", "30").with_value("page_size", 15);
        let state = PaginationState::seed(PaginationType::Offset, &ctx, 100);
        assert_eq!((state.offset, state.page_size), (30, 15));

        let mut out = QueryContext::new();
        state.apply_to(&mut out);
        assert_eq!(out.get_u64("offset"), Some(30));
        assert_eq!(out.get_u64("page_size"), Some(15));
        assert!(!out.contains("page_number"));
    }

    #[test]
    fn unpaginated_sr_stops_after_one_page() {
        let state = PaginationState::seed(PaginationType::None, &QueryContext::new(), 10);
        assert_eq!(
            PaginationDriver::new(100).next(&state, &extra(&[("total_items", json!(99))])),
            PageDecision::Stop(StopReason::NotPaginated)
        );
    }

    proptest! {
        #[test]
        fn offset_requests_cover_total_exactly_once(total in 1u64..5_000, size in 1u64..500) {
            let state = PaginationState::seed(PaginationType::Offset, &QueryContext::new(), size);
            let (seen, reason) = drive(
                PaginationDriver::new(u32::MAX),
                state,
                &extra(&[("total_items", json!(total))]),
            );
            prop_assert_eq!(reason, StopReason::Exhausted);
            prop_assert_eq!(seen.len() as u64, total.div_ceil(size));
            for (i, s) in seen.iter().enumerate() {
                prop_assert_eq!(s.offset, i as u64 * size);
            }
        }

        #[test]
        fn page_requests_never_exceed_cap(total in 0u64..1_000, cap in 1u32..50) {
            let state = PaginationState::seed(PaginationType::Page, &QueryContext::new(), 10);
            let (seen, _) = drive(
                PaginationDriver::new(cap),
                state,
                &extra(&[("total_pages", json!(total))]),
            );
            prop_assert!(seen.len() as u64 <= u64::from(cap));
            prop_assert!(seen.len() as u64 <= total.max(1));
        }
    }
}
