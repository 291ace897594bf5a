//! Client gateway.
//!
//! Clients talk to any node over a line-oriented TCP connection. Each line
//! is forwarded to the leader as a REQUEST and answered right away with a
//! synthesized success reply. The reply does not wait for the request to
//! be ordered or applied: a client that sees `[success:...]` only knows the
//! node accepted the request, not that any replica executed it.
//!
//! Blank lines are separators: they are neither forwarded nor answered,
//! since an empty operation can never be executed and its proposal would
//! never be acknowledged. Bytes that are not UTF-8 are replaced, so a
//! garbled line still gets its reply and the connection stays open.

use std::io;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedSender;

use crate::metrics;
use crate::tob::message::Message;
use crate::tob::{NodeId, Outbound};
use crate::transport::read_raw_line;

pub struct Gateway {
    leader: NodeId,
    outbox: UnboundedSender<Outbound>,
}

impl Gateway {
    pub fn new(leader: NodeId, outbox: UnboundedSender<Outbound>) -> Self {
        Gateway { leader, outbox }
    }

    /// Forwards one client line to the leader and returns the client reply.
    ///
    /// A JSON object line carries the operation in its `request` field and
    /// is answered with the same object plus a `response` field. Any other
    /// line is itself the operation and is answered with plain text.
    pub fn handle(&self, line: &str) -> String {
        let object = match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(object)) => Some(object),
            _ => None,
        };
        let request = object
            .as_ref()
            .and_then(|o| o.get("request"))
            .and_then(Value::as_str)
            .unwrap_or(line)
            .to_string();

        log::info!("forwarding request {:?} to leader {}", request, self.leader);
        if let Err(e) = self.forward(request) {
            log::error!("failed to forward request to {}: {}", self.leader, e);
        }

        let response = format!("[success:{}]", line);
        match object {
            Some(mut object) => {
                object.insert("response".to_string(), Value::String(response));
                Value::Object(object).to_string()
            }
            None => response,
        }
    }

    fn forward(&self, request: String) -> crate::error::Result<()> {
        let data = Message::Request { request }.encode()?;
        self.outbox
            .send(Outbound {
                to: self.leader.clone(),
                data,
            })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "outbound mailbox closed"))?;
        Ok(())
    }
}

/// Accepts client connections until the listener fails.
pub async fn serve_clients(listener: TcpListener, gateway: Arc<Gateway>) -> io::Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        let gateway = gateway.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, &gateway).await {
                log::warn!("client {} disconnected: {}", addr, e);
            }
        });
    }
}

async fn handle_client(stream: TcpStream, gateway: &Gateway) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    while let Some(raw) = read_raw_line(&mut reader).await? {
        let line = String::from_utf8_lossy(&raw);
        if line.trim().is_empty() {
            continue;
        }
        let mut reply = metrics::record_metrics("client_request", || gateway.handle(&line));
        reply.push('\n');
        writer.write_all(reply.as_bytes()).await?;
    }
    Ok(())
}
