pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn new_nonce() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
