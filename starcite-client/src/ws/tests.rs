use std::time::Duration;

use super::ReconnectPolicy;

fn policy_without_jitter() -> ReconnectPolicy {
    ReconnectPolicy {
        jitter_ratio: 0.0,
        ..ReconnectPolicy::default()
    }
}

#[test]
fn delay_grows_exponentially() {
    let policy = policy_without_jitter();
    assert_eq!(policy.delay(1), Duration::from_millis(500));
    assert_eq!(policy.delay(2), Duration::from_millis(1000));
    assert_eq!(policy.delay(3), Duration::from_millis(2000));
    assert_eq!(policy.delay(4), Duration::from_millis(4000));
}

#[test]
fn delay_is_capped_at_max_delay() {
    let policy = policy_without_jitter();
    assert_eq!(policy.delay(10), Duration::from_millis(15_000));
    assert_eq!(policy.delay(100), Duration::from_millis(15_000));
}

#[test]
fn jitter_stays_within_the_configured_ratio() {
    let policy = ReconnectPolicy::default();
    for completed_attempts in 1..8 {
        let base = policy_without_jitter().delay(completed_attempts);
        for _ in 0..64 {
            let jittered = policy.delay(completed_attempts).as_secs_f64();
            let lo = base.as_secs_f64() * (1.0 - policy.jitter_ratio) - f64::EPSILON;
            let hi = base.as_secs_f64() * (1.0 + policy.jitter_ratio) + f64::EPSILON;
            assert!(
                (lo..=hi).contains(&jittered),
                "attempt {completed_attempts}: {jittered} outside [{lo}, {hi}]"
            );
        }
    }
}
