//! Flat lifecycle operations: access requests, setup codes, PIN login.
//!
//! PIN, password and setup code all use the same bcrypt scheme at the same
//! cost. Hash work runs on the blocking pool so connection tasks never stall
//! behind it.

use crate::registry::{normalize_flat_id, FlatId};
use crate::store::IdentityError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Row};

const HASH_COST: u32 = bcrypt::DEFAULT_COST;

/// How many recent setup codes are considered when redeeming.
const CODE_LOOKBACK: i64 = 5;

/// Result of `create_access_request`.
#[derive(Debug, Serialize)]
pub struct AccessRequestOutcome {
    pub id: i64,
    pub status: String,
    pub reused: bool,
}

/// Most recent access request for a flat.
#[derive(Debug, Serialize)]
pub struct RequestStatus {
    pub id: i64,
    pub status: String,
}

/// Current flat row, reduced to what the setup page needs.
#[derive(Debug, Serialize)]
pub struct FlatStatus {
    pub status: String,
    #[serde(rename = "pinSet")]
    pub pin_set: bool,
    pub banned: bool,
    #[serde(rename = "requiresAdminRevoke")]
    pub requires_admin_revoke: bool,
}

/// Combined view for `GET /api/setup-status`. Both halves may be absent.
#[derive(Debug, Serialize)]
pub struct SetupStatus {
    pub request: Option<RequestStatus>,
    pub flat: Option<FlatStatus>,
}

struct FlatRow {
    status: String,
    pin_hash: Option<String>,
    password_hash: Option<String>,
    ban_until: Option<DateTime<Utc>>,
    requires_admin_revoke: bool,
}

struct SetupCodeRow {
    id: i64,
    code_hash: String,
    expires_at: i64,
    used_at: Option<i64>,
}

impl SetupCodeRow {
    fn redeemable(&self, now_ms: i64) -> bool {
        self.used_at.is_none() && self.expires_at > now_ms
    }
}

/// File a new access request, or return the already-pending one.
pub async fn create_access_request(
    pool: &PgPool,
    raw_flat_id: &str,
    name: &str,
) -> Result<AccessRequestOutcome, IdentityError> {
    let flat_id = normalize_flat_id(raw_flat_id);
    let name = name.trim();
    if flat_id.is_empty() || name.is_empty() {
        return Err(IdentityError::MissingFields);
    }

    let pending = sqlx::query(
        "SELECT id, status FROM flat_requests \
         WHERE flat_id = $1 AND status = 'PENDING' \
         ORDER BY id DESC LIMIT 1",
    )
    .bind(&flat_id)
    .fetch_optional(pool)
    .await?;

    if let Some(row) = pending {
        return Ok(AccessRequestOutcome {
            id: row.try_get("id")?,
            status: row.try_get("status")?,
            reused: true,
        });
    }

    let now = Utc::now();
    let inserted = sqlx::query(
        "INSERT INTO flat_requests (flat_id, name, note, status, created_at, updated_at) \
         VALUES ($1, $2, '', 'PENDING', $3, $3) RETURNING id",
    )
    .bind(&flat_id)
    .bind(name)
    .bind(now)
    .fetch_one(pool)
    .await?;

    Ok(AccessRequestOutcome {
        id: inserted.try_get("id")?,
        status: "PENDING".to_string(),
        reused: false,
    })
}

/// Report the request and flat state for a flat id.
pub async fn setup_status(
    pool: &PgPool,
    raw_flat_id: &str,
) -> Result<(FlatId, SetupStatus), IdentityError> {
    let flat_id = normalize_flat_id(raw_flat_id);
    if flat_id.is_empty() {
        return Err(IdentityError::MissingFlatId);
    }

    let request = sqlx::query(
        "SELECT id, status FROM flat_requests WHERE flat_id = $1 ORDER BY id DESC LIMIT 1",
    )
    .bind(&flat_id)
    .fetch_optional(pool)
    .await?
    .map(|row| -> Result<RequestStatus, sqlx::Error> {
        Ok(RequestStatus {
            id: row.try_get("id")?,
            status: row.try_get("status")?,
        })
    })
    .transpose()?;

    let flat = fetch_flat(pool, &flat_id).await?.map(|row| FlatStatus {
        banned: row.banned_now(),
        pin_set: row.pin_hash.is_some(),
        requires_admin_revoke: row.requires_admin_revoke,
        status: row.status,
    });

    Ok((flat_id, SetupStatus { request, flat }))
}

/// Redeem a setup code and bind PIN (and optional password) to the flat.
///
/// The flat write and the code consumption commit together or not at all;
/// a code that lost the race to another redeem rolls the whole thing back.
pub async fn setup_pin_with_code(
    pool: &PgPool,
    raw_flat_id: &str,
    code: &str,
    pin4: &str,
    password: Option<&str>,
) -> Result<(), IdentityError> {
    let flat_id = normalize_flat_id(raw_flat_id);
    let code = code.trim();
    if flat_id.is_empty() || code.is_empty() || pin4.is_empty() {
        return Err(IdentityError::MissingFields);
    }
    if !is_pin4(pin4) {
        return Err(IdentityError::PinMustBe4Digits);
    }

    let flat = fetch_flat(pool, &flat_id)
        .await?
        .ok_or(IdentityError::FlatNotFound)?;
    if flat.status != "ACTIVE" {
        return Err(IdentityError::FlatDisabled);
    }

    let rows = sqlx::query(
        "SELECT id, code_hash, expires_at, used_at FROM setup_codes \
         WHERE flat_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2",
    )
    .bind(&flat_id)
    .bind(CODE_LOOKBACK)
    .fetch_all(pool)
    .await?;

    let now_ms = Utc::now().timestamp_millis();
    let mut recent = Vec::new();
    for row in rows {
        recent.push(SetupCodeRow {
            id: row.try_get("id")?,
            code_hash: row.try_get("code_hash")?,
            expires_at: row.try_get("expires_at")?,
            used_at: row.try_get("used_at")?,
        });
    }

    // Match against every recent code so a used code answers INVALID_CODE,
    // not NO_VALID_CODE; the latter means nothing redeemable is on file.
    let mut matched: Option<&SetupCodeRow> = None;
    for candidate in &recent {
        if verify_blocking(code.to_string(), candidate.code_hash.clone()).await? {
            matched = Some(candidate);
            break;
        }
    }
    let code_id = match matched {
        Some(candidate) if candidate.redeemable(now_ms) => candidate.id,
        Some(_) => return Err(IdentityError::InvalidCode),
        None => {
            if recent.iter().any(|c| c.redeemable(now_ms)) {
                return Err(IdentityError::InvalidCode);
            }
            return Err(IdentityError::NoValidCode);
        }
    };

    let pin_hash = hash_blocking(pin4.to_string()).await?;
    let password_hash = match password.map(str::trim) {
        Some(p) if !p.is_empty() => Some(hash_blocking(p.to_string()).await?),
        _ => None,
    };

    let mut tx = pool.begin().await?;
    sqlx::query(
        "UPDATE flats SET pin_hash = $1, password_hash = COALESCE($2, password_hash), \
         updated_at = $3 WHERE flat_id = $4",
    )
    .bind(&pin_hash)
    .bind(&password_hash)
    .bind(Utc::now())
    .bind(&flat_id)
    .execute(&mut *tx)
    .await?;

    let consumed = sqlx::query("UPDATE setup_codes SET used_at = $1 WHERE id = $2 AND used_at IS NULL")
        .bind(now_ms)
        .bind(code_id)
        .execute(&mut *tx)
        .await?;
    if consumed.rows_affected() != 1 {
        tx.rollback().await?;
        return Err(IdentityError::InvalidCode);
    }

    tx.commit().await?;
    Ok(())
}

/// Verify credentials and return the canonical flat id.
///
/// Checks run in the order the setup page reports them: existence, disabled,
/// ban, admin revoke, pin-not-set, pin format, password requirement, then
/// the credential verification itself.
pub async fn login_flat(
    pool: &PgPool,
    raw_flat_id: &str,
    pin4: &str,
    password: Option<&str>,
) -> Result<FlatId, IdentityError> {
    let flat_id = normalize_flat_id(raw_flat_id);

    let flat = fetch_flat(pool, &flat_id)
        .await?
        .ok_or(IdentityError::FlatNotFound)?;
    if flat.status != "ACTIVE" {
        return Err(IdentityError::FlatDisabled);
    }
    if let Some(until) = flat.ban_until {
        if until > Utc::now() {
            return Err(IdentityError::Banned { until });
        }
    }
    if flat.requires_admin_revoke {
        return Err(IdentityError::AdminRevokeRequired);
    }
    let pin_hash = flat.pin_hash.ok_or(IdentityError::PinNotSet)?;
    if !is_pin4(pin4) {
        return Err(IdentityError::InvalidPin);
    }
    let password = password.map(str::trim).unwrap_or("");
    if flat.password_hash.is_some() && password.is_empty() {
        return Err(IdentityError::PasswordRequired);
    }

    if !verify_blocking(pin4.to_string(), pin_hash).await? {
        return Err(IdentityError::InvalidCredentials);
    }
    if let Some(password_hash) = flat.password_hash {
        if !verify_blocking(password.to_string(), password_hash).await? {
            return Err(IdentityError::InvalidCredentials);
        }
    }

    sqlx::query("UPDATE flats SET last_login_at = $1 WHERE flat_id = $2")
        .bind(Utc::now())
        .bind(&flat_id)
        .execute(pool)
        .await?;

    Ok(flat_id)
}

impl FlatRow {
    fn banned_now(&self) -> bool {
        self.ban_until.map(|until| until > Utc::now()).unwrap_or(false)
    }
}

async fn fetch_flat(pool: &PgPool, flat_id: &str) -> Result<Option<FlatRow>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT status, pin_hash, password_hash, ban_until, requires_admin_revoke \
         FROM flats WHERE flat_id = $1",
    )
    .bind(flat_id)
    .fetch_optional(pool)
    .await?;

    row.map(|row| -> Result<FlatRow, sqlx::Error> {
        Ok(FlatRow {
            status: row.try_get("status")?,
            pin_hash: row.try_get("pin_hash")?,
            password_hash: row.try_get("password_hash")?,
            ban_until: row.try_get("ban_until")?,
            requires_admin_revoke: row.try_get("requires_admin_revoke")?,
        })
    })
    .transpose()
}

fn is_pin4(pin: &str) -> bool {
    pin.len() == 4 && pin.bytes().all(|b| b.is_ascii_digit())
}

async fn hash_blocking(value: String) -> Result<String, IdentityError> {
    tokio::task::spawn_blocking(move || bcrypt::hash(value, HASH_COST))
        .await
        .map_err(|e| IdentityError::Hashing(e.to_string()))?
        .map_err(|e| IdentityError::Hashing(e.to_string()))
}

async fn verify_blocking(value: String, hash: String) -> Result<bool, IdentityError> {
    tokio::task::spawn_blocking(move || bcrypt::verify(value, &hash))
        .await
        .map_err(|e| IdentityError::Hashing(e.to_string()))?
        .map_err(|e| IdentityError::Hashing(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_format_is_exactly_four_digits() {
        assert!(is_pin4("0000"));
        assert!(is_pin4("5678"));
        assert!(!is_pin4("567"));
        assert!(!is_pin4("56789"));
        assert!(!is_pin4("56a8"));
        assert!(!is_pin4(" 5678"));
        assert!(!is_pin4(""));
    }

    #[test]
    fn code_redeemability_window() {
        let row = SetupCodeRow {
            id: 1,
            code_hash: String::new(),
            expires_at: 1_000,
            used_at: None,
        };
        assert!(row.redeemable(999));
        assert!(!row.redeemable(1_000));
        assert!(!row.redeemable(1_001));

        let used = SetupCodeRow {
            id: 2,
            code_hash: String::new(),
            expires_at: i64::MAX,
            used_at: Some(500),
        };
        assert!(!used.redeemable(0));
    }

    #[tokio::test]
    async fn hash_and_verify_round_trip() {
        let hash = hash_blocking("1234".to_string()).await.unwrap();
        assert!(verify_blocking("1234".to_string(), hash.clone()).await.unwrap());
        assert!(!verify_blocking("4321".to_string(), hash).await.unwrap());
    }
}
