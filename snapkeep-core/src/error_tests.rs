/*!
Tests for error handling and error types.
*/

#[cfg(test)]
mod tests {
    use crate::error::SnapkeepError;
    use crate::provider::ProviderError;
    use snapkeep_retry::RetryError;
    use std::io;

    #[test]
    fn test_snapkeep_error_display() {
        let error = SnapkeepError::validation("test validation error");
        assert_eq!(error.to_string(), "Validation error: test validation error");

        let error = SnapkeepError::storage("test storage error");
        assert_eq!(error.to_string(), "Storage error: test storage error");

        let error =
            SnapkeepError::policy_violation("max_snapshots_per_instance must be at least 1");
        assert_eq!(
            error.to_string(),
            "Policy violation: max_snapshots_per_instance must be at least 1"
        );
    }

    #[test]
    fn test_snapkeep_error_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let error = SnapkeepError::from(io_error);

        assert!(matches!(error, SnapkeepError::Io(_)));
    }

    #[test]
    fn test_permanent_retry_error_maps_to_provider() {
        let err = RetryError::Permanent {
            operation: "create_image",
            source: ProviderError::permanent("InvalidInstanceID.NotFound"),
        };

        match SnapkeepError::from(err) {
            SnapkeepError::Provider(source) => {
                assert!(source.message.contains("InvalidInstanceID"))
            }
            other => panic!("expected Provider error, got {other:?}"),
        }
    }

    #[test]
    fn test_exhausted_retry_error_is_transient() {
        let err = RetryError::MaxRetriesExceeded {
            operation: "delete_image",
            attempts: 3,
            source: ProviderError::transient("RequestLimitExceeded"),
        };

        let error = SnapkeepError::from(err);
        assert!(error.is_transient());
        assert!(error.to_string().contains("delete_image"));
        assert!(error.to_string().contains("3 attempts"));
    }

    #[test]
    fn test_timed_out_retry_error() {
        let err: RetryError<ProviderError> = RetryError::TimedOut {
            operation: "list_images",
            attempts: 2,
        };

        let error = SnapkeepError::from(err);
        assert!(matches!(
            error,
            SnapkeepError::TimedOut {
                operation: "list_images",
                attempts: 2
            }
        ));
    }

    #[test]
    fn test_recorded_inconsistent_needs_reconcile() {
        let error = SnapkeepError::RecordedInconsistent {
            instance_id: "i-1".to_string(),
            image_id: "ami-1".to_string(),
            reason: "disk full".to_string(),
        };

        assert!(error.needs_reconcile());
        assert!(!error.is_transient());
        assert!(error.to_string().contains("ami-1"));
        assert!(error.to_string().contains("i-1"));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<SnapkeepError>();
        assert_sync::<SnapkeepError>();
    }
}
