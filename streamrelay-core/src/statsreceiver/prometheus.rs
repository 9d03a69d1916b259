use super::StatsReceiver;
use crate::Result;
use crate::metrics::{
    CATEGORY_LABEL, CODE_LABEL, STAGE_LABEL, STATUS_LABEL, TARGET_LABEL, labels, relay_metrics,
};
use crate::observer::buffer::ObserverBuffer;

/// Counters grow by each window's totals; the latency gauges hold the maxima of the last window.
#[derive(Debug, Default, Clone)]
pub struct PrometheusStatsReceiver;

impl PrometheusStatsReceiver {
    pub fn new() -> Self {
        Self
    }
}

impl StatsReceiver for PrometheusStatsReceiver {
    async fn send(&self, buffer: &ObserverBuffer) -> Result<()> {
        let metrics = relay_metrics();

        for (target, results, sent, failed) in [
            (
                "primary",
                buffer.target_results,
                buffer.msg_sent,
                buffer.msg_failed,
            ),
            (
                "oversized",
                buffer.oversized_target_results,
                buffer.oversized_msg_sent,
                buffer.oversized_msg_failed,
            ),
            (
                "invalid",
                buffer.invalid_target_results,
                buffer.invalid_msg_sent,
                buffer.invalid_msg_failed,
            ),
        ] {
            metrics
                .target_results_total
                .get_or_create(&labels(&[(TARGET_LABEL, target)]))
                .inc_by(results);
            metrics
                .messages_total
                .get_or_create(&labels(&[(TARGET_LABEL, target), (STATUS_LABEL, "sent")]))
                .inc_by(sent);
            metrics
                .messages_total
                .get_or_create(&labels(&[(TARGET_LABEL, target), (STATUS_LABEL, "failed")]))
                .inc_by(failed);
        }
        metrics.filtered_total.inc_by(buffer.msg_filtered);

        for (category, errors) in [
            ("failed", &buffer.failed_errors),
            ("invalid", &buffer.invalid_errors),
        ] {
            for (key, count) in errors {
                metrics
                    .errors_total
                    .get_or_create(&labels(&[
                        (CATEGORY_LABEL, category),
                        (CODE_LABEL, key.code.as_str()),
                    ]))
                    .inc_by(*count);
            }
        }

        for (stage, latency) in [
            ("processing", buffer.max_proc_latency),
            ("message", buffer.max_msg_latency),
            ("filter", buffer.max_filter_latency),
            ("transform", buffer.max_transform_latency),
            ("request", buffer.max_request_latency),
        ] {
            metrics
                .max_latency
                .get_or_create(&labels(&[(STAGE_LABEL, stage)]))
                .set(i64::try_from(latency.as_millis()).unwrap_or(i64::MAX));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::buffer::ErrorKey;

    #[tokio::test]
    async fn test_send_updates_registry() {
        let mut buffer = ObserverBuffer {
            invalid_target_results: 2,
            invalid_msg_sent: 3,
            ..Default::default()
        };
        buffer.invalid_errors.insert(
            ErrorKey {
                code: "PrometheusTestCode".to_string(),
                description: "test".to_string(),
            },
            4,
        );

        PrometheusStatsReceiver::new().send(&buffer).await.unwrap();

        let metrics = relay_metrics();
        let errors = metrics
            .errors_total
            .get_or_create(&labels(&[
                (CATEGORY_LABEL, "invalid"),
                (CODE_LABEL, "PrometheusTestCode"),
            ]))
            .get();
        assert_eq!(errors, 4);
    }
}
