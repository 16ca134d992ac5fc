use crate::error::FetchError;
use crate::upstream::{JoinDetails, RawResponse};

/// What a single upstream response means for the job.
#[derive(Debug)]
pub enum AttemptOutcome {
    Success(JoinDetails),
    AuthExpired { token: String, body: String },
    RateLimited,
    Failed(FetchError),
}

impl AttemptOutcome {
    pub fn from_response(resp: RawResponse) -> Self {
        if resp.is_success() {
            return match JoinDetails::parse(&resp.body) {
                Ok(details) => AttemptOutcome::Success(details),
                Err(err) => AttemptOutcome::Failed(err),
            };
        }
        match resp.status {
            403 => match resp.csrf_token.filter(|t| !t.is_empty()) {
                Some(token) => AttemptOutcome::AuthExpired {
                    token,
                    body: resp.body,
                },
                None => AttemptOutcome::Failed(FetchError::Upstream {
                    status: 403,
                    body: resp.body,
                }),
            },
            429 => AttemptOutcome::RateLimited,
            status => AttemptOutcome::Failed(FetchError::Upstream {
                status,
                body: resp.body,
            }),
        }
    }
}

#[derive(Debug)]
pub enum Step {
    Done(Result<JoinDetails, FetchError>),
    /// Store the refreshed token and repeat the attempt immediately.
    RefreshToken(String),
    /// Pause every job for a fresh jittered delay, then repeat.
    Backoff,
}

/// Per-job retry ceilings. Each outcome class draws from its own counter.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    auth_left: u32,
    rate_limit_left: u32,
}

impl RetryBudget {
    pub fn new(auth_retries: u32, rate_limit_retries: u32) -> Self {
        Self {
            auth_left: auth_retries,
            rate_limit_left: rate_limit_retries,
        }
    }

    pub fn next(&mut self, outcome: AttemptOutcome) -> Step {
        match outcome {
            AttemptOutcome::Success(details) => Step::Done(Ok(details)),
            AttemptOutcome::AuthExpired { token, body } => {
                if self.auth_left == 0 {
                    return Step::Done(Err(FetchError::Upstream { status: 403, body }));
                }
                self.auth_left -= 1;
                Step::RefreshToken(token)
            }
            AttemptOutcome::RateLimited => {
                if self.rate_limit_left == 0 {
                    return Step::Done(Err(FetchError::RateLimited));
                }
                self.rate_limit_left -= 1;
                Step::Backoff
            }
            AttemptOutcome::Failed(err) => Step::Done(Err(err)),
        }
    }
}
