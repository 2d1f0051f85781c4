use ulid::Ulid;

pub const SERVER_ID_PREFIX: &str = "srv_";
pub const CUSTOMER_ID_PREFIX: &str = "cus_";

pub fn new_server_id() -> String {
    format!("{SERVER_ID_PREFIX}{}", Ulid::new())
}

pub fn new_customer_id() -> String {
    format!("{CUSTOMER_ID_PREFIX}{}", Ulid::new())
}

pub fn has_ulid_suffix(s: &str, prefix: &str) -> bool {
    s.strip_prefix(prefix)
        .is_some_and(|rest| Ulid::from_string(rest).is_ok())
}
