//! The local control socket: where client processes connect to ask
//! for lookups, browses, and resolves.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixListener;
use tokio::sync::mpsc;

use mdns_engine::control::ClientId;
use mdns_engine::engine::Event;
use mdns_types::control::deserialise::deserialise_request;
use mdns_types::control::serialise::serialise_response;
use mdns_types::control::types::{ControlResponse, PAYLOAD_MAX_LEN};

/// Bind the control socket, replacing a stale one from a previous
/// run.  The socket is usable by owner and group only.
pub fn bind(path: &Path) -> io::Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => return Err(error),
    }

    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))?;

    Ok(listener)
}

/// Accept control connections forever, giving each a client id and a
/// pair of IO tasks.
pub async fn listen(listener: UnixListener, events: mpsc::UnboundedSender<Event>) {
    let mut connections = 0u64;

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                connections += 1;
                let client = ClientId(connections);
                tracing::info!(%client, "control connection");

                let (tx, rx) = mpsc::unbounded_channel();
                if events.send(Event::Connected { client, tx }).is_err() {
                    break;
                }

                let (read_half, write_half) = stream.into_split();
                tokio::spawn(read_task(client, read_half, events.clone()));
                tokio::spawn(write_task(client, write_half, rx));
            }
            Err(error) => tracing::debug!(?error, "control accept error"),
        }
    }
}

/// Read frames until the client hangs up or sends something framed so
/// badly the connection cannot continue.  A malformed payload only
/// costs the one request.
async fn read_task(
    client: ClientId,
    mut stream: OwnedReadHalf,
    events: mpsc::UnboundedSender<Event>,
) {
    loop {
        let Ok(length) = stream.read_u16().await else {
            break;
        };
        let Ok(mtype) = stream.read_u16().await else {
            break;
        };

        let length = usize::from(length);
        if length > PAYLOAD_MAX_LEN {
            tracing::warn!(%client, length, "oversized control frame, closing");
            break;
        }

        let mut payload = vec![0u8; length];
        if stream.read_exact(&mut payload).await.is_err() {
            break;
        }

        match deserialise_request(mtype, &payload) {
            Ok(request) => {
                if events.send(Event::Request { client, request }).is_err() {
                    return;
                }
            }
            Err(error) => {
                tracing::warn!(%client, %error, "dropping malformed control request");
            }
        }
    }

    let _ = events.send(Event::Disconnected { client });
}

/// Drain the engine's answers onto the socket.  Ends when the engine
/// drops the channel on disconnect.
async fn write_task(
    client: ClientId,
    mut stream: OwnedWriteHalf,
    mut responses: mpsc::UnboundedReceiver<ControlResponse>,
) {
    while let Some(response) = responses.recv().await {
        let frame = serialise_response(&response);
        if let Err(error) = stream.write_all(&frame).await {
            tracing::debug!(%client, ?error, "control write error");
            break;
        }
    }
}
