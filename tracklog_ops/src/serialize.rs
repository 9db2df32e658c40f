//! JSON encoding of [`Operation`] values.
//!
//! Every operation is written as one JSON object carrying a `"type"` tag taken from
//! [`Operation::TAGS`]. Non-finite floats are written as strings, since JSON has no literal for
//! them.

use crate::{Error, Operation, Result};

pub fn serialize(op: &Operation) -> Result<Vec<u8>> {
    serde_json::to_vec(op).map_err(Error::Serialize)
}

pub fn deserialize(bytes: &[u8]) -> Result<Operation> {
    serde_json::from_slice(bytes).map_err(|source| Error::MalformedOperation { source })
}

pub(crate) mod float_repr {
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    const NAN: &str = "NaN";
    const INFINITY: &str = "Infinity";
    const NEG_INFINITY: &str = "-Infinity";

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub(crate) fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_str(NAN)
        } else if value.is_infinite() {
            serializer.serialize_str(if value.is_sign_positive() {
                INFINITY
            } else {
                NEG_INFINITY
            })
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(v) => Ok(v),
            Repr::Text(text) => match text.as_str() {
                NAN => Ok(f64::NAN),
                INFINITY => Ok(f64::INFINITY),
                NEG_INFINITY => Ok(f64::NEG_INFINITY),
                other => Err(D::Error::custom(format!("invalid float value: {other}"))),
            },
        }
    }

    pub(crate) mod option {
        use serde::{Deserialize, Deserializer, Serializer};

        #[derive(Deserialize)]
        struct Wrapped(#[serde(with = "super")] f64);

        pub(crate) fn serialize<S: Serializer>(
            value: &Option<f64>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(v) => super::serialize(v, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<f64>, D::Error> {
            Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|Wrapped(v)| v))
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;
    use crate::{
        ArtifactFileEntry, AttributePath, ContainerType, CopySourceKind, ImageValue,
        LogSeriesValue,
    };

    fn path(s: &str) -> AttributePath {
        AttributePath::parse(s).unwrap()
    }

    /// One representative of every variant.
    fn all_variants() -> Vec<Operation> {
        vec![
            Operation::AssignFloat {
                path: path("params/lr"),
                value: 0.001,
            },
            Operation::AssignInt {
                path: path("params/epochs"),
                value: -12,
            },
            Operation::AssignBool {
                path: path("params/shuffle"),
                value: true,
            },
            Operation::AssignString {
                path: path("sys/description"),
                value: "line one\nline two\t\"quoted\"".to_string(),
            },
            Operation::AssignDatetime {
                path: path("sys/created"),
                value: Utc.timestamp_millis_opt(1_700_000_000_123).unwrap(),
            },
            Operation::AssignArtifact {
                path: path("data/train"),
                hash: "abc123".to_string(),
            },
            Operation::UploadFile {
                path: path("model/weights"),
                ext: "pt".to_string(),
                file_path: "/tmp/weights.pt".to_string(),
                clean_after_upload: true,
            },
            Operation::UploadFileContent {
                path: path("source/code"),
                ext: "py".to_string(),
                file_content: "cHJpbnQoMSk=".to_string(),
            },
            Operation::UploadFileSet {
                path: path("source/files"),
                file_globs: vec![],
                reset: true,
            },
            Operation::DeleteFiles {
                path: path("source/files"),
                file_paths: vec!["a.py".to_string(), "b.py".to_string()],
            },
            Operation::LogFloats {
                path: path("metrics/loss"),
                values: vec![
                    LogSeriesValue::new(1.5, Some(1.0), 10.0),
                    LogSeriesValue::new(0.25, None, 11.0),
                ],
            },
            Operation::LogStrings {
                path: path("logs/stdout"),
                values: vec![LogSeriesValue::new("epoch 1\n".to_string(), None, 12.5)],
            },
            Operation::LogImages {
                path: path("images/samples"),
                values: vec![LogSeriesValue::new(
                    ImageValue {
                        data: Some("iVBORw0KGgo=".to_string()),
                        name: Some("sample".to_string()),
                        description: None,
                    },
                    Some(3.0),
                    13.0,
                )],
            },
            Operation::ClearFloatLog {
                path: path("metrics/loss"),
            },
            Operation::ClearStringLog {
                path: path("logs/stdout"),
            },
            Operation::ClearImageLog {
                path: path("images/samples"),
            },
            Operation::ConfigFloatSeries {
                path: path("metrics/acc"),
                min: Some(0.0),
                max: None,
                unit: Some("%".to_string()),
            },
            Operation::AddStrings {
                path: path("sys/tags"),
                values: vec!["b".to_string(), "a".to_string()],
            },
            Operation::RemoveStrings {
                path: path("sys/tags"),
                values: vec![],
            },
            Operation::ClearStringSet {
                path: path("sys/tags"),
            },
            Operation::DeleteAttribute {
                path: path("params/lr"),
            },
            Operation::TrackFilesToArtifact {
                path: path("data/train"),
                project_id: "proj-1".to_string(),
                entries: vec![
                    ArtifactFileEntry {
                        file_path: "s3://bucket/a".to_string(),
                        destination: None,
                    },
                    ArtifactFileEntry {
                        file_path: "/data/b".to_string(),
                        destination: Some("b".to_string()),
                    },
                ],
            },
            Operation::ClearArtifact {
                path: path("data/train"),
            },
            Operation::CopyAttribute {
                path: path("params/lr"),
                container_id: "RUN-12".to_string(),
                container_type: ContainerType::Run,
                source_path: path("params/lr"),
                source_kind: CopySourceKind::Float,
            },
        ]
    }

    #[test]
    fn round_trip_every_variant() {
        for op in all_variants() {
            let bytes = serialize(&op).unwrap();
            let decoded = deserialize(&bytes).unwrap();
            assert_eq!(op, decoded);
        }
    }

    #[test]
    fn tag_table_matches_variants() {
        let variants = all_variants();
        assert_eq!(variants.len(), Operation::TAGS.len());
        for (op, tag) in variants.iter().zip(Operation::TAGS) {
            assert_eq!(op.kind(), *tag);
            let value: serde_json::Value = serde_json::from_slice(&serialize(op).unwrap()).unwrap();
            assert_eq!(value["type"], *tag);
        }
    }

    #[test]
    fn non_finite_floats_round_trip() {
        let op = Operation::LogFloats {
            path: path("metrics/odd"),
            values: vec![
                LogSeriesValue::new(f64::NAN, Some(f64::NAN), 1.0),
                LogSeriesValue::new(f64::INFINITY, None, 2.0),
                LogSeriesValue::new(f64::NEG_INFINITY, Some(3.0), 3.0),
            ],
        };
        let text = String::from_utf8(serialize(&op).unwrap()).unwrap();
        assert!(text.contains("\"NaN\""));
        assert!(text.contains("\"-Infinity\""));

        let Operation::LogFloats { values, .. } = deserialize(text.as_bytes()).unwrap() else {
            panic!("decoded into the wrong variant");
        };
        assert!(values[0].value.is_nan());
        assert!(values[0].step.unwrap().is_nan());
        assert_eq!(values[1].value, f64::INFINITY);
        assert_eq!(values[1].step, None);
        assert_eq!(values[2].value, f64::NEG_INFINITY);

        let assign = Operation::AssignFloat {
            path: path("x"),
            value: f64::INFINITY,
        };
        assert_eq!(deserialize(&serialize(&assign).unwrap()).unwrap(), assign);
    }

    #[test]
    fn unknown_tag_is_malformed() {
        let err = deserialize(br#"{"type":"RenameAttribute","path":["a"]}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedOperation { .. }));

        let err = deserialize(br#"{"type":"AssignFloat","path":[],"value":1.0}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedOperation { .. }));

        let err = deserialize(br#"{"type":"AssignFloat","path":["a"],"value":"fast"}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedOperation { .. }));
    }

    proptest! {
        #[test]
        fn prop_assign_string_round_trip(s in ".*", segments in prop::collection::vec("[a-z]{1,8}", 1..4)) {
            let op = Operation::AssignString {
                path: AttributePath::new(segments).unwrap(),
                value: s,
            };
            let decoded = deserialize(&serialize(&op).unwrap()).unwrap();
            prop_assert_eq!(op, decoded);
        }

        #[test]
        fn prop_log_floats_round_trip(points in prop::collection::vec((any::<f64>(), proptest::option::of(any::<f64>()), 0.0f64..1e10), 0..20)) {
            let op = Operation::LogFloats {
                path: path("metrics/prop"),
                values: points
                    .iter()
                    .map(|(v, s, ts)| LogSeriesValue::new(*v, *s, *ts))
                    .collect(),
            };
            let Operation::LogFloats { values, .. } = deserialize(&serialize(&op).unwrap()).unwrap() else {
                panic!("decoded into the wrong variant");
            };
            prop_assert_eq!(values.len(), points.len());
            for (decoded, (v, s, ts)) in values.iter().zip(&points) {
                prop_assert!(decoded.value == *v || (decoded.value.is_nan() && v.is_nan()));
                match (decoded.step, s) {
                    (Some(a), Some(b)) => prop_assert!(a == *b || (a.is_nan() && b.is_nan())),
                    (None, None) => {}
                    other => prop_assert!(false, "step mismatch: {:?}", other),
                }
                prop_assert_eq!(decoded.ts, *ts);
            }
        }
    }
}
