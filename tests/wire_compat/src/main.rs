fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use labsync_protocol::{
        DatasetRecord, FileRecord, InstrumentRecord, NewExperiment, NewFileRecord, Replica,
        StorageClass, UserRecord, VerificationState,
    };

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    /// Deserializes a recorded remote payload, which may carry fields the
    /// typed record does not model.
    fn parse<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_value(load_fixture(name))
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"))
    }

    /// Deserializes a request payload, re-serializes it, and compares the
    /// JSON values (order-independent).
    fn roundtrip_test<T>(name: &str)
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));
        assert_eq!(
            fixture, reserialized,
            "roundtrip mismatch for {name}:\n  recorded: {fixture}\n  rust:     {reserialized}"
        );
    }

    // --- Remote records ---

    #[test]
    fn fixture_user_record() {
        let user: UserRecord = parse("user_record.json");
        assert_eq!(user.id, 12);
        assert_eq!(user.username, "testuser1");
        assert_eq!(user.full_name(), "Test User1");
        assert_eq!(user.email, "testuser1@example.com");
    }

    #[test]
    fn fixture_instrument_record() {
        let instrument: InstrumentRecord = parse("instrument_record.json");
        assert_eq!(instrument.name, "Test Instrument");
        assert_eq!(instrument.facility_id, 2);
    }

    #[test]
    fn fixture_dataset_record() {
        let dataset: DatasetRecord = parse("dataset_record.json");
        assert_eq!(dataset.id, 40);
        assert_eq!(dataset.experiments, vec![17]);
        assert_eq!(dataset.instrument_id, Some(5));
    }

    #[test]
    fn fixture_file_record() {
        let record: FileRecord = parse("file_record.json");
        assert_eq!(record.dataset_id, 40);
        assert_eq!(record.directory, "raw/day1");
        assert_eq!(record.size, 1_048_576);
        assert_eq!(record.sha256sum.len(), 64);
    }

    #[test]
    fn fixture_replica_list() {
        let replicas: Vec<Replica> = parse("replica_list.json");
        assert_eq!(replicas.len(), 3);

        assert_eq!(replicas[0].storage_class, StorageClass::Staging);
        assert!(replicas[0].is_staged());
        assert!(!replicas[0].verified);

        assert_eq!(replicas[1].storage_class, StorageClass::Direct);
        assert!(replicas[1].verified);

        // Storage classes the pipeline does not know about still parse.
        assert_eq!(replicas[2].storage_class, StorageClass::Other);
    }

    #[test]
    fn verification_states() {
        for (raw, expected) in [
            ("\"pending\"", VerificationState::Pending),
            ("\"verified\"", VerificationState::Verified),
            ("\"mismatched\"", VerificationState::Mismatched),
        ] {
            let state: VerificationState = serde_json::from_str(raw).unwrap();
            assert_eq!(state, expected);
        }
    }

    // --- Request payloads ---

    #[test]
    fn fixture_new_experiment() {
        roundtrip_test::<NewExperiment>("new_experiment.json");
    }

    #[test]
    fn fixture_new_file_record() {
        roundtrip_test::<NewFileRecord>("new_file_record.json");
    }
}
