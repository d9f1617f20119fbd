//! Integrity validation for bucket collections.
//!
//! Runs at the deserialization boundary (raw JSON from storage or clients)
//! and again before every persisted mutation. A violation is never repaired.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::BucketViolation;
use crate::models::{Bucket, BucketSource};

const REQUIRED_FIELDS: [&str; 5] = ["id", "source", "seconds", "consumed", "expires_at"];

/// Check a typed collection: non-negative values, consumed within granted,
/// non-empty unique ids.
pub fn validate(buckets: &[Bucket]) -> Result<(), BucketViolation> {
    let mut seen = HashSet::with_capacity(buckets.len());

    for (index, bucket) in buckets.iter().enumerate() {
        if bucket.id.is_empty() {
            return Err(BucketViolation::EmptyId { index });
        }
        if bucket.seconds < 0 {
            return Err(BucketViolation::Negative {
                id: bucket.id.clone(),
                field: "seconds",
            });
        }
        if bucket.consumed < 0 {
            return Err(BucketViolation::Negative {
                id: bucket.id.clone(),
                field: "consumed",
            });
        }
        if bucket.consumed > bucket.seconds {
            return Err(BucketViolation::OverConsumed {
                id: bucket.id.clone(),
                consumed: bucket.consumed,
                seconds: bucket.seconds,
            });
        }
        if !seen.insert(bucket.id.as_str()) {
            return Err(BucketViolation::DuplicateId {
                id: bucket.id.clone(),
            });
        }
    }

    Ok(())
}

/// Parse and validate the persisted JSON shape.
pub fn parse_buckets(raw: &Value) -> Result<Vec<Bucket>, BucketViolation> {
    let items = raw.as_array().ok_or(BucketViolation::NotAnArray)?;
    let mut buckets = Vec::with_capacity(items.len());

    for (index, item) in items.iter().enumerate() {
        let object = item
            .as_object()
            .ok_or(BucketViolation::NotAnObject { index })?;

        for field in REQUIRED_FIELDS {
            if !object.contains_key(field) {
                return Err(BucketViolation::MissingField { index, field });
            }
        }

        let id = object["id"]
            .as_str()
            .ok_or(BucketViolation::WrongType { index, field: "id" })?
            .to_string();

        let source_name = object["source"]
            .as_str()
            .ok_or(BucketViolation::WrongType {
                index,
                field: "source",
            })?;
        let source = BucketSource::from_string(source_name).ok_or_else(|| {
            BucketViolation::UnknownSource {
                index,
                source_name: source_name.to_string(),
            }
        })?;

        let seconds = object["seconds"].as_i64().ok_or(BucketViolation::WrongType {
            index,
            field: "seconds",
        })?;
        let consumed = object["consumed"].as_i64().ok_or(BucketViolation::WrongType {
            index,
            field: "consumed",
        })?;

        let expires_at = match &object["expires_at"] {
            Value::Null => None,
            Value::String(text) => Some(
                DateTime::parse_from_rfc3339(text)
                    .map_err(|_| BucketViolation::BadTimestamp {
                        index,
                        value: text.clone(),
                    })?
                    .with_timezone(&Utc),
            ),
            other => {
                return Err(BucketViolation::BadTimestamp {
                    index,
                    value: other.to_string(),
                })
            }
        };

        buckets.push(Bucket {
            id,
            source,
            seconds,
            consumed,
            expires_at,
        });
    }

    validate(&buckets)?;
    Ok(buckets)
}

/// Boolean form of [`parse_buckets`].
pub fn is_valid(raw: &Value) -> bool {
    parse_buckets(raw).is_ok()
}
