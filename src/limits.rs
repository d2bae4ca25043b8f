//! Hard caps on input sizes and per-tenant state.

pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_RESIDENCY_ID_LEN: usize = 128;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_IMAGE_LEN: usize = 2048;

pub const MAX_BOOKINGS_PER_USER: usize = 1_000;
pub const MAX_FAVORITES_PER_USER: usize = 1_000;
pub const MAX_USERS_PER_TENANT: usize = 1_000_000;

pub const MAX_TENANTS: usize = 64;
pub const MAX_TENANT_NAME_LEN: usize = 64;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: i64 = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: i64 = 253_402_300_799_999;
