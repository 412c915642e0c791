use tally_statsd::GaugeMetric;

/// Gauge metrics for Tally system components.
pub enum SystemGauges {
    /// A number of messages queued in a services inbound message channel.
    ///
    /// This metric is emitted at most once per second for every running service. Without
    /// backlogs, this number should be close to `0`. If this number stays at the channel capacity,
    /// producers are blocked on backpressure.
    ///
    /// This metric is tagged with:
    ///  - `service`: The name of the service implementation.
    ServiceBackPressure,
}

impl GaugeMetric for SystemGauges {
    fn name(&self) -> &'static str {
        match *self {
            SystemGauges::ServiceBackPressure => "service.back_pressure",
        }
    }
}
