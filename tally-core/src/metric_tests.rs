/*!
Tests for metric parsing, validation and the JSON wire form.
*/

#[cfg(test)]
mod tests {
    use crate::metric::{Metric, MetricKind, MetricRecord, MetricValue};
    use crate::TallyError;

    #[test]
    fn test_parse_path_encoded_metrics() {
        let gauge = Metric::parse("gauge", "Alloc", "12.5").unwrap();
        assert_eq!(gauge, Metric::gauge("Alloc", 12.5));

        let counter = Metric::parse("counter", "PollCount", "7").unwrap();
        assert_eq!(counter, Metric::counter("PollCount", 7));
    }

    #[test]
    fn test_kind_is_case_insensitive() {
        assert_eq!("GAUGE".parse::<MetricKind>().unwrap(), MetricKind::Gauge);
        assert_eq!("Counter".parse::<MetricKind>().unwrap(), MetricKind::Counter);
    }

    #[test]
    fn test_unknown_kind_is_validation_error() {
        let err = Metric::parse("histogram", "x", "1").unwrap_err();
        assert!(matches!(err, TallyError::Validation(_)));
        assert!(err.to_string().contains("histogram"));
    }

    #[test]
    fn test_counter_rejects_non_integer() {
        assert!(matches!(
            Metric::parse("counter", "x", "1.5"),
            Err(TallyError::Validation(_))
        ));
        assert!(matches!(
            Metric::parse("counter", "x", "99999999999999999999"),
            Err(TallyError::Validation(_))
        ));
    }

    #[test]
    fn test_gauge_rejects_garbage_and_non_finite() {
        assert!(Metric::parse("gauge", "x", "abc").is_err());
        assert!(Metric::parse("gauge", "x", "NaN").is_err());
        assert!(Metric::parse("gauge", "x", "inf").is_err());
    }

    #[test]
    fn test_empty_name_rejected() {
        assert!(matches!(
            Metric::parse("gauge", " ", "1"),
            Err(TallyError::Validation(_))
        ));
    }

    #[test]
    fn test_value_display() {
        assert_eq!(MetricValue::Gauge(3.0).to_string(), "3");
        assert_eq!(MetricValue::Gauge(0.25).to_string(), "0.25");
        assert_eq!(MetricValue::Counter(-4).to_string(), "-4");
    }

    #[test]
    fn test_record_json_shape() {
        let record = MetricRecord::from(Metric::counter("PollCount", 3));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": "PollCount", "type": "counter", "delta": 3})
        );

        let record: MetricRecord =
            serde_json::from_str(r#"{"id":"Alloc","type":"gauge","value":1.5}"#).unwrap();
        assert_eq!(Metric::try_from(record).unwrap(), Metric::gauge("Alloc", 1.5));
    }

    #[test]
    fn test_record_missing_value_for_kind() {
        let record = MetricRecord {
            id: "x".to_string(),
            mtype: "counter".to_string(),
            delta: None,
            value: Some(1.0),
        };
        assert!(matches!(
            Metric::try_from(record),
            Err(TallyError::Validation(_))
        ));
    }

    #[test]
    fn test_record_key_probe() {
        let record: MetricRecord = serde_json::from_str(r#"{"id":"x","type":"gauge"}"#).unwrap();
        assert_eq!(record.key().unwrap(), (MetricKind::Gauge, "x"));
    }
}
