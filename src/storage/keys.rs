//! Key layout for the fjall partitions
//!
//! Partition structure:
//! - `tasks`: task:{task_id} -> Task (JSON)
//! - `workers`: worker:{worker_id} -> Worker (JSON)
//! - `metadata`: meta:{key} -> value (string)

/// Encode a task key: task:{task_id}
pub fn encode_task_key(task_id: &str) -> Vec<u8> {
    format!("task:{}", task_id).into_bytes()
}

/// Decode a task key: task:{task_id} -> task_id
pub fn decode_task_key(key: &[u8]) -> Option<String> {
    let key_str = std::str::from_utf8(key).ok()?;
    key_str.strip_prefix("task:").map(String::from)
}

/// Encode a worker key: worker:{worker_id}
pub fn encode_worker_key(worker_id: &str) -> Vec<u8> {
    format!("worker:{}", worker_id).into_bytes()
}

/// Decode a worker key: worker:{worker_id} -> worker_id
pub fn decode_worker_key(key: &[u8]) -> Option<String> {
    let key_str = std::str::from_utf8(key).ok()?;
    key_str.strip_prefix("worker:").map(String::from)
}

/// Encode a metadata key: meta:{key}
pub fn encode_meta_key(key: &str) -> Vec<u8> {
    format!("meta:{}", key).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_key_encoding() {
        let key = encode_task_key("task-123");
        assert_eq!(key, b"task:task-123");
        assert_eq!(decode_task_key(&key), Some("task-123".to_string()));
    }

    #[test]
    fn test_worker_key_encoding() {
        let key = encode_worker_key("worker-a");
        assert_eq!(key, b"worker:worker-a");
        assert_eq!(decode_worker_key(&key), Some("worker-a".to_string()));
    }

    #[test]
    fn test_decode_rejects_foreign_prefix() {
        assert_eq!(decode_task_key(b"worker:abc"), None);
        assert_eq!(decode_worker_key(b"task:abc"), None);
        assert_eq!(decode_task_key(&[0xff, 0xfe]), None);
    }

    #[test]
    fn test_meta_key_encoding() {
        assert_eq!(encode_meta_key("schema_version"), b"meta:schema_version");
    }
}
