//! Token authentication for the gateway's `/ws` endpoint. The wire
//! transport and authentication are an explicit out-of-scope boundary
//! (spec §1): callers consume a method abstraction rather than depend on
//! any particular auth scheme, so this stays intentionally thin — a single
//! shared-secret check, not a user/session model.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    None,
    Token,
}

#[derive(Debug, Clone)]
pub struct ResolvedAuth {
    pub mode: AuthMode,
    pub token: Option<String>,
}

impl ResolvedAuth {
    pub fn none() -> Self {
        Self { mode: AuthMode::None, token: None }
    }

    pub fn token(token: impl Into<String>) -> Self {
        Self { mode: AuthMode::Token, token: Some(token.into()) }
    }

    pub fn verify(&self, provided: Option<&str>) -> Result<(), String> {
        match self.mode {
            AuthMode::None => Ok(()),
            AuthMode::Token => {
                let expected = self.token.as_deref().ok_or_else(|| "no token configured".to_string())?;
                let provided = provided.ok_or_else(|| "token required".to_string())?;
                if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
                    return Err("invalid token".to_string());
                }
                Ok(())
            }
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
