//! Server-side sessions keyed by a signed, HTTP-only cookie.
//!
//! The session id is random; the cookie carries `sid.signature` where the
//! signature is an HMAC over the sid under `SESSION_SECRET`. Rows live in
//! `user_sessions` with the conventional `sid`/`sess`/`expire` columns.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde_json::json;
use sha1::Sha1;
use sqlx::{PgPool, Row};

/// Cookie carrying the signed session id.
pub const COOKIE_NAME: &str = "audix_user_sid";

const SESSION_TTL_DAYS: i64 = 7;
const REMEMBER_TTL_DAYS: i64 = 30;

/// Create a session row for a logged-in flat.
///
/// Returns the raw sid (sign it before setting the cookie) and the absolute
/// expiry written to the row.
pub async fn create_session(
    pool: &PgPool,
    flat_id: &str,
    remember: bool,
) -> Result<(String, DateTime<Utc>), sqlx::Error> {
    let sid = random_sid();
    let ttl_days = if remember {
        REMEMBER_TTL_DAYS
    } else {
        SESSION_TTL_DAYS
    };
    let expire = Utc::now() + Duration::days(ttl_days);
    let sess = json!({ "user": { "flat_id": flat_id } });

    sqlx::query("INSERT INTO user_sessions (sid, sess, expire) VALUES ($1, $2, $3)")
        .bind(&sid)
        .bind(&sess)
        .bind(expire)
        .execute(pool)
        .await?;

    Ok((sid, expire))
}

/// Resolve a sid to its flat id, ignoring expired rows.
pub async fn session_flat_id(pool: &PgPool, sid: &str) -> Result<Option<String>, sqlx::Error> {
    let row = sqlx::query("SELECT sess FROM user_sessions WHERE sid = $1 AND expire > now()")
        .bind(sid)
        .fetch_optional(pool)
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let sess: serde_json::Value = row.try_get("sess")?;
    Ok(sess
        .get("user")
        .and_then(|user| user.get("flat_id"))
        .and_then(|v| v.as_str())
        .map(str::to_string))
}

/// Drop the session row. Missing rows are fine.
pub async fn destroy_session(pool: &PgPool, sid: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM user_sessions WHERE sid = $1")
        .bind(sid)
        .execute(pool)
        .await?;
    Ok(())
}

/// Delete expired session rows; returns how many went away.
pub async fn sweep_expired(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM user_sessions WHERE expire <= now()")
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Signed cookie value for a sid.
pub fn sign_sid(secret: &str, sid: &str) -> String {
    format!("{}.{}", sid, hmac_sha1_b64(secret, sid))
}

/// Verify a cookie value and extract the sid. The signature check is
/// constant-time.
pub fn verify_cookie_value(secret: &str, value: &str) -> Option<String> {
    let (sid, signature) = value.rsplit_once('.')?;
    if sid.is_empty() {
        return None;
    }
    let expected = hmac_sha1_b64(secret, sid);
    if constant_time_eq(signature.as_bytes(), expected.as_bytes()) {
        Some(sid.to_string())
    } else {
        None
    }
}

/// `Set-Cookie` value for a fresh login.
///
/// Without `remember` the cookie is non-persistent (no Max-Age); the
/// server-side row still expires after its own TTL.
pub fn login_cookie(signed: &str, remember: bool, secure: bool) -> String {
    let mut cookie = format!("{}={}; Path=/; HttpOnly; SameSite=Lax", COOKIE_NAME, signed);
    if remember {
        cookie.push_str(&format!(
            "; Max-Age={}",
            Duration::days(REMEMBER_TTL_DAYS).num_seconds()
        ));
    }
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// `Set-Cookie` value that clears the session cookie.
pub fn clear_cookie(secure: bool) -> String {
    let mut cookie = format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", COOKIE_NAME);
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Compare secrets without leaking the mismatch position.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn random_sid() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hmac_sha1_b64(secret: &str, message: &str) -> String {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| Hmac::<Sha1>::new_from_slice(&[]).expect("empty hmac key"));
    mac.update(message.as_bytes());
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}
