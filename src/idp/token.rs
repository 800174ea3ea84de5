//! Admin bearer-token cache with a waiter queue.
//!
//! Almost every admin request needs a bearer token first, so concurrent callers must
//! not fan out into concurrent `ClientToken` grants. The first caller becomes the
//! refresher; everyone arriving while the refresh is in flight parks on a oneshot and
//! is fired in submission order with the same token (or the same error).

use std::{future::Future, time::Duration};

use tokio::sync::{oneshot, Mutex};

use crate::{
    error::{Error, Result},
    store::unix_now,
};

#[derive(Clone, Debug)]
pub(crate) struct CachedToken {
    pub(crate) access_token: String,
    /// Unix timestamp the IdP advertised.
    pub(crate) expires_at: u64,
}

enum Refresh {
    Idle,
    InFlight(Vec<oneshot::Sender<Result<String>>>),
}

struct TokenState {
    cached: Option<CachedToken>,
    refresh: Refresh,
}

pub(crate) struct AdminTokenCache {
    state: Mutex<TokenState>,
    refresh_margin: Duration,
}

impl AdminTokenCache {
    pub(crate) fn new(refresh_margin: Duration, seed: Option<CachedToken>) -> Self {
        Self {
            state: Mutex::new(TokenState {
                cached: seed,
                refresh: Refresh::Idle,
            }),
            refresh_margin,
        }
    }

    /// Returns a token that is valid for at least the refresh margin, running `fetch`
    /// at most once across all concurrent callers.
    pub(crate) async fn ensure_token<F, Fut>(&self, fetch: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedToken>>,
    {
        let rx = {
            let mut state = self.state.lock().await;
            if let Some(ref cached) = state.cached {
                if cached.expires_at > unix_now() + self.refresh_margin.as_secs() {
                    return Ok(cached.access_token.clone());
                }
            }
            match state.refresh {
                Refresh::InFlight(ref mut waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                Refresh::Idle => {
                    state.refresh = Refresh::InFlight(Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = rx {
            return rx
                .await
                .map_err(|_| Error::internal("token refresh abandoned"))?;
        }

        // This caller is the refresher.
        let outcome = fetch().await;

        let mut state = self.state.lock().await;
        let waiters = match std::mem::replace(&mut state.refresh, Refresh::Idle) {
            Refresh::InFlight(waiters) => waiters,
            Refresh::Idle => Vec::new(),
        };
        let result = match outcome {
            Ok(token) => {
                state.cached = Some(token.clone());
                Ok(token.access_token)
            }
            Err(err) => Err(err),
        };
        drop(state);

        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
        result
    }
}
