//! Property tests: labels agree with the statistics each call was scored
//! against, and the model only absorbs what the outlier policy allows.

use insitu_detect::{DetectorConfig, OutlierDetector, OutlierPolicy};
use insitu_stats::RunningStats;
use insitu_trace::ExecData;
use insitu_types::{CallId, CallLabel, FunctionId, ThreadKey};
use proptest::prelude::*;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn calls(fid: FunctionId, runtimes: &[u64]) -> Vec<ExecData> {
    let thread = ThreadKey::new(0, 0, 0);
    let mut t = 0;
    runtimes
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let call = ExecData::new(CallId::new(thread, i as u64), fid, "f", t, t + r);
            t += r + 1;
            call
        })
        .collect()
}

fn detector(policy: OutlierPolicy, sigma: f64, min_samples: u64) -> OutlierDetector {
    OutlierDetector::new(DetectorConfig {
        sigma,
        min_samples,
        outlier_policy: policy,
        ..Default::default()
    })
    .unwrap()
}

fn runtimes() -> impl Strategy<Value = Vec<u64>> {
    prop_oneof![
        proptest::collection::vec(90u64..110, 1..150),
        proptest::collection::vec(prop_oneof![9 => 90u64..110, 1 => 1_000u64..5_000], 1..150),
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn labels_match_a_shadow_model(
        runtimes in runtimes(),
        sigma in 1.0f64..5.0,
        min_samples in 1u64..20,
    ) {
        let mut det = detector(OutlierPolicy::ExcludeOutliers, sigma, min_samples);
        let mut batch = calls(1, &runtimes);
        det.compute_outliers(1, &mut batch);

        let mut shadow = RunningStats::new();
        for call in &batch {
            let value = call.runtime() as f64;
            let sd = shadow.stddev(0);
            let flag = shadow.count() >= min_samples
                && sd.is_finite()
                && sd >= f64::EPSILON
                && ((value - shadow.mean()) / sd).abs() > sigma;
            prop_assert_eq!(call.is_outlier(), flag);
            if call.is_outlier() {
                prop_assert!(call.score() > sigma);
                prop_assert!((call.severity() - (call.score() - sigma)).abs() < 1e-9);
            } else {
                prop_assert_eq!(call.severity(), 0.0);
                shadow.push(value);
            }
        }
        prop_assert_eq!(det.function_stats(1).map_or(0, |s| s.count()), shadow.count());
    }

    #[test]
    fn policy_decides_what_the_model_absorbs(runtimes in runtimes()) {
        for policy in [OutlierPolicy::IncludeOutliers, OutlierPolicy::ExcludeOutliers] {
            let mut det = detector(policy, 3.0, 5);
            let mut batch = calls(1, &runtimes);
            let flagged = det.compute_outliers(1, &mut batch) as u64;

            let expected = match policy {
                OutlierPolicy::IncludeOutliers => runtimes.len() as u64,
                OutlierPolicy::ExcludeOutliers => runtimes.len() as u64 - flagged,
            };
            let model = det.function_stats(1).map_or(0, |s| s.count());
            prop_assert_eq!(model, expected);
            // without a sync the delta mirrors the model
            prop_assert_eq!(det.local_delta().get(1).map_or(0, |s| s.count()), model);

            let metrics = det.metrics().get(1).unwrap();
            prop_assert_eq!(metrics.calls, runtimes.len() as u64);
            prop_assert_eq!(metrics.outliers, flagged);
        }
    }

    #[test]
    fn nothing_is_flagged_during_bootstrap(
        runtimes in proptest::collection::vec(1u64..1_000_000, 1..30),
    ) {
        let min_samples = runtimes.len() as u64;
        let mut det = detector(OutlierPolicy::IncludeOutliers, 1.0, min_samples);
        let mut batch = calls(7, &runtimes);
        prop_assert_eq!(det.compute_outliers(7, &mut batch), 0);
        prop_assert!(batch.iter().all(|c| c.label() == CallLabel::Normal));
    }
}
