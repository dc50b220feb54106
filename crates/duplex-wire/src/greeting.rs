//! Greeting: the one-shot display-name exchange after authentication.
//!
//! The accepting side sends a single `@duplex-greeting` request carrying its
//! name and needs a positive acknowledgement. The dialing side waits for that
//! request, acknowledges it, and from then on answers every other
//! connection-level request (keepalives included) negatively.

use crate::error::WireError;
use crate::message::{self, GreetingPayload, GREETING_REQUEST};
use crate::transport::{Request, Session};
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Default bound on waiting for the greeting or its acknowledgement.
pub const DEFAULT_GREETING_TIMEOUT: Duration = Duration::from_secs(10);

/// Acceptor role: announce `name` and require an acknowledgement.
pub async fn greet(session: &Session, name: &str, timeout: Duration) -> Result<(), WireError> {
    let payload = message::encode(&GreetingPayload {
        name: name.to_string(),
    })?;
    let (ok, _) = tokio::time::timeout(
        timeout,
        session.send_request(GREETING_REQUEST, true, Bytes::from(payload)),
    )
    .await
    .map_err(|_| WireError::Timeout("greeting acknowledgement"))??;
    if !ok {
        return Err(WireError::GreetingFailed(
            "greeting was not acknowledged".to_string(),
        ));
    }
    Ok(())
}

/// Initiator role: wait for the remote's greeting and return its name.
///
/// Takes over the session's connection-level request queue for the rest of
/// the session's life.
pub async fn await_greeting(
    requests: mpsc::UnboundedReceiver<Request>,
    timeout: Duration,
) -> Result<String, WireError> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(serve_requests(requests, tx));
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(WireError::ConnectionClosed),
        Err(_) => Err(WireError::Timeout("greeting")),
    }
}

async fn serve_requests(
    mut requests: mpsc::UnboundedReceiver<Request>,
    greeted: oneshot::Sender<Result<String, WireError>>,
) {
    let mut greeted = Some(greeted);
    while let Some(request) = requests.recv().await {
        if request.name() == GREETING_REQUEST {
            if let Some(tx) = greeted.take() {
                match message::decode::<GreetingPayload>(request.payload()) {
                    Ok(greeting) => {
                        request.reply(true, Bytes::new());
                        let _ = tx.send(Ok(greeting.name));
                    }
                    Err(e) => {
                        warn!(error = %e, "Malformed greeting");
                        request.reply(false, Bytes::new());
                        let _ = tx.send(Err(WireError::GreetingFailed(format!(
                            "malformed greeting: {e}"
                        ))));
                    }
                }
                continue;
            }
        }
        debug!(request = %request.name(), "Declining out-of-band request");
        request.reply(false, Bytes::new());
    }
}
