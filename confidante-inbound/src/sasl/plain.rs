use std::{fmt::Display, str::FromStr};

use anyhow::{anyhow, Error};
use argon2::{
    password_hash::{self, rand_core::OsRng, PasswordHashString, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use confidante_core::xmpp::jid::Jid;
use rsasl::{
    callback::SessionCallback,
    config::SASLConfig,
    property::{AuthId, Password},
};
use tokio::{
    select,
    sync::{mpsc, oneshot},
    task::{spawn_blocking, JoinHandle},
};

use super::common::{authenticate, SessionCallbackExt};
use super::{MechanismNegotiatorResult, StoredPassword, StoredPasswordLookup};

#[derive(Debug)]
pub struct StoredPasswordArgon2 {
    pub hash: PasswordHashString,
}

impl StoredPassword for StoredPasswordArgon2 {
    fn new(plaintext: &str) -> Result<Self, Error> {
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::default();
        let hash = argon2.hash_password(plaintext.as_bytes(), &salt)?.into();
        Ok(Self { hash })
    }
}

impl FromStr for StoredPasswordArgon2 {
    type Err = password_hash::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hash = PasswordHashString::new(s)?;
        Ok(Self { hash })
    }
}

impl Display for StoredPasswordArgon2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hash)
    }
}

struct PlainCallback {
    tx: mpsc::Sender<(String, oneshot::Sender<Result<StoredPasswordArgon2, Error>>)>,
}

impl PlainCallback {
    fn new(tx: mpsc::Sender<(String, oneshot::Sender<Result<StoredPasswordArgon2, Error>>)>) -> Self {
        Self { tx }
    }
}

impl SessionCallback for PlainCallback {
    fn callback(
        &self,
        _session_data: &rsasl::callback::SessionData,
        _context: &rsasl::callback::Context,
        _request: &mut rsasl::callback::Request,
    ) -> Result<(), rsasl::prelude::SessionError> {
        Ok(())
    }

    fn validate(
        &self,
        _session_data: &rsasl::callback::SessionData,
        context: &rsasl::callback::Context,
        validate: &mut rsasl::validate::Validate<'_>,
    ) -> Result<(), rsasl::validate::ValidationError> {
        use super::common::AuthError;

        validate.with::<super::common::SaslValidation, _>(|| {
            let Some(authid) = context.get_ref::<AuthId>() else {
                return Ok(Err(AuthError::NoSuchUser));
            };
            let Some(password) = context.get_ref::<Password>() else {
                return Ok(Err(AuthError::PasswordIncorrect));
            };

            let Ok(stored) = self.lookup_stored_password::<StoredPasswordArgon2>(authid, self.tx.clone()) else {
                return Ok(Err(AuthError::NoSuchUser));
            };

            match Argon2::default().verify_password(password, &stored.hash.password_hash()) {
                Ok(()) => Ok(Ok(authid.to_string())),
                Err(_) => Ok(Err(AuthError::PasswordIncorrect)),
            }
        })?;

        Ok(())
    }
}

/// SASL PLAIN, run through the same `rsasl`/blocking-thread plumbing as
/// SCRAM (see `scram.rs`): PLAIN only ever takes one round-trip, but
/// sharing `authenticate()` keeps the server-side state machine (and
/// its error reporting) in one place instead of hand-rolling the
/// `authzid\0authcid\0password` split here.
pub struct PlainNegotiator<S> {
    resolved_domain: String,
    input_tx: mpsc::Sender<Vec<u8>>,
    output_rx: mpsc::Receiver<MechanismNegotiatorResult>,
    password_lookup_rx: mpsc::Receiver<(String, oneshot::Sender<Result<StoredPasswordArgon2, Error>>)>,
    store: S,
    authenticator: JoinHandle<Result<String, Error>>,
}

impl<S> PlainNegotiator<S>
where
    S: StoredPasswordLookup + Send + Sync,
{
    pub fn new(resolved_domain: String, store: S) -> Result<Self, Error> {
        let (input_tx, input_rx) = mpsc::channel::<Vec<u8>>(1);
        let (output_tx, output_rx) = mpsc::channel::<MechanismNegotiatorResult>(1);
        let (password_lookup_tx, password_lookup_rx) = mpsc::channel(1);

        let config = SASLConfig::builder()
            .with_defaults()
            .with_callback(PlainCallback::new(password_lookup_tx))?;

        let mechname = "PLAIN".try_into()?;

        let authenticator =
            spawn_blocking(move || authenticate(config, mechname, input_rx, output_tx));

        Ok(Self {
            resolved_domain,
            input_tx,
            output_rx,
            password_lookup_rx,
            store,
            authenticator,
        })
    }

    pub async fn process(&mut self, payload: Vec<u8>) -> MechanismNegotiatorResult {
        if self.input_tx.send(payload).await.is_err() {
            return MechanismNegotiatorResult::Failure(anyhow!("PLAIN authenticator task is gone"));
        }

        loop {
            select! {
                Some(output) = self.output_rx.recv() => {
                    return output;
                }
                Some((authid, response_tx)) = self.password_lookup_rx.recv() => {
                    let jid = Jid::new(Some(authid), self.resolved_domain.clone(), None);
                    let result = self
                        .store
                        .get_stored_password_argon2(jid)
                        .await
                        .and_then(|s| s.parse::<StoredPasswordArgon2>().map_err(|err| anyhow!(err)));
                    let _ = response_tx.send(result);
                }
            }
        }
    }

    pub async fn authentication_id(self) -> Result<String, Error> {
        self.authenticator.await?
    }
}
