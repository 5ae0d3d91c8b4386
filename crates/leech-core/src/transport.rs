//! Size-bounded request view for the presentation transport.
//!
//! The channel to the presentation layer has a hard message ceiling. Large
//! response bodies can aggregate past it, so the view degrades step by step
//! until the serialized payload fits.

use serde::Serialize;

use crate::model::CapturedRequest;

/// URL fragments of endpoints whose responses are kept as long as possible.
pub const PRIVILEGED_URL_FRAGMENTS: &[&str] = &[
    "hometimeline",
    "home_timeline_urt",
    "threaded_conversation_with_injections_v2",
];

/// Limits applied by [`bounded_view`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundedViewLimits {
    /// Byte budget of the serialized `{"requests": [...]}` payload.
    pub max_bytes: usize,
    /// Newest records whose responses survive the first reduction.
    pub privileged_prefix: usize,
    /// Header cap of the last lossy reduction.
    pub header_cap: usize,
}

#[derive(Serialize)]
struct Envelope<'a> {
    requests: &'a [CapturedRequest],
}

/// Serialized size of the transport envelope for `records`.
pub fn payload_size(records: &[CapturedRequest]) -> usize {
    serde_json::to_vec(&Envelope { requests: records })
        .map(|v| v.len())
        .unwrap_or(usize::MAX)
}

fn is_privileged(index: usize, record: &CapturedRequest, prefix: usize) -> bool {
    if index < prefix {
        return true;
    }
    let url = record.url.to_lowercase();
    PRIVILEGED_URL_FRAGMENTS.iter().any(|f| url.contains(f))
}

/// Builds the largest-fidelity view of `records` that fits the byte budget.
///
/// Steps, in order: full records; responses kept only for privileged entries;
/// no responses; no bodies and capped headers; the newest 75% repeatedly.
/// When nothing fits, the newest record alone is returned.
pub fn bounded_view(records: &[CapturedRequest], limits: BoundedViewLimits) -> Vec<CapturedRequest> {
    let fits = |view: &[CapturedRequest]| payload_size(view) <= limits.max_bytes;

    if fits(records) {
        return records.to_vec();
    }

    let prioritized: Vec<CapturedRequest> = records
        .iter()
        .enumerate()
        .map(|(idx, r)| {
            if is_privileged(idx, r, limits.privileged_prefix) {
                r.clone()
            } else {
                CapturedRequest {
                    response_body: None,
                    ..r.clone()
                }
            }
        })
        .collect();
    if fits(&prioritized) {
        tracing::debug!("Bounded view: kept privileged responses only");
        return prioritized;
    }

    let mut view: Vec<CapturedRequest> = prioritized
        .into_iter()
        .map(|r| CapturedRequest {
            response_body: None,
            ..r
        })
        .collect();
    if fits(&view) {
        tracing::debug!("Bounded view: dropped all responses");
        return view;
    }

    for r in &mut view {
        r.body = None;
        r.headers.truncate(limits.header_cap);
    }
    if fits(&view) {
        tracing::debug!("Bounded view: dropped bodies and capped headers");
        return view;
    }

    let mut end = view.len();
    while end > 1 {
        end = end * 3 / 4;
        if fits(&view[..end]) {
            tracing::debug!(kept = end, total = view.len(), "Bounded view: dropped oldest records");
            view.truncate(end);
            return view;
        }
    }

    tracing::warn!(
        total = records.len(),
        max_bytes = limits.max_bytes,
        "Bounded view: returning newest record only"
    );
    view.truncate(1);
    view
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Header, RequestType};
    use chrono::DateTime;

    fn record(i: usize, body: &str, response: &str) -> CapturedRequest {
        CapturedRequest {
            id: i as f64,
            url: format!("https://a.test/{i}"),
            method: "POST".into(),
            headers: (0..40).map(|h| Header::new(format!("h{h}"), "v")).collect(),
            body: Some(body.into()),
            response_body: Some(response.into()),
            timestamp: DateTime::from_timestamp_millis(i as i64).unwrap(),
            request_type: RequestType::Fetch,
            tab_id: 1,
            initiator: String::new(),
        }
    }

    fn limits(max_bytes: usize) -> BoundedViewLimits {
        BoundedViewLimits {
            max_bytes,
            privileged_prefix: 2,
            header_cap: 30,
        }
    }

    #[test]
    fn full_fidelity_when_it_fits() {
        let records = vec![record(0, "b", "r")];
        let view = bounded_view(&records, limits(usize::MAX));
        assert_eq!(view, records);
    }

    #[test]
    fn privileged_responses_survive_first_step() {
        let big = "x".repeat(10_000);
        let mut records: Vec<_> = (0..5).map(|i| record(i, "b", &big)).collect();
        records[4].url = "https://x.test/i/api/graphql/HomeTimeline".into();

        let full = payload_size(&records);
        let view = bounded_view(&records, limits(full - 10_000));

        assert!(view[0].response_body.is_some());
        assert!(view[1].response_body.is_some());
        assert!(view[2].response_body.is_none());
        assert!(view[3].response_body.is_none());
        assert!(view[4].response_body.is_some());
    }

    #[test]
    fn bodies_and_headers_go_before_records() {
        let records: Vec<_> = (0..4).map(|i| record(i, &"b".repeat(5000), "r")).collect();
        let stripped: Vec<_> = records
            .iter()
            .map(|r| {
                let mut r = r.clone();
                r.response_body = None;
                r.body = None;
                r.headers.truncate(30);
                r
            })
            .collect();
        let budget = payload_size(&stripped);

        let view = bounded_view(&records, limits(budget));
        assert_eq!(view.len(), 4);
        assert!(view.iter().all(|r| r.body.is_none() && r.headers.len() == 30));
        assert!(payload_size(&view) <= budget);
    }

    #[test]
    fn drops_oldest_records_until_it_fits() {
        let records: Vec<_> = (0..100).map(|i| record(i, "b", "r")).collect();
        let one = payload_size(&records[..1]);
        let view = bounded_view(&records, limits(one * 20));
        assert!(view.len() < 100);
        assert!(view.len() > 1);
        assert_eq!(view[0].id, 0.0);
        assert!(payload_size(&view) <= one * 20);
    }

    #[test]
    fn single_record_last_resort() {
        let records: Vec<_> = (0..3).map(|i| record(i, "b", "r")).collect();
        let view = bounded_view(&records, limits(10));
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].id, 0.0);
    }

    #[test]
    fn empty_store_gives_empty_view() {
        assert!(bounded_view(&[], limits(1)).is_empty());
    }
}
