//! Wire format for the word-count service.
//!
//! One JSON object per line in each direction:
//!
//! ```text
//! -> {"method":"list_docs"}
//! <- {"docs":["doc1.txt","dune.txt"]}
//! -> {"method":"count_words","doc":"dune.txt","keyword":"Paul"}
//! <- {"count":{"doc":"dune.txt","keyword":"paul","count":12,"cached":false}}
//! <- {"error":"document nope.txt not found"}
//! ```

use std::io;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tracing::{debug, info, warn, Instrument};

use crate::wordcount::{CountWordsResponse, WordCount, WordCountError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RpcRequest {
    ListDocs,
    CountWords { doc: String, keyword: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcReply {
    Docs(Vec<String>),
    Count(CountWordsResponse),
    Error(String),
}

async fn dispatch<W: WordCount>(service: &W, request: RpcRequest) -> RpcReply {
    let result = match request {
        RpcRequest::ListDocs => service.list_docs().await.map(RpcReply::Docs),
        RpcRequest::CountWords { doc, keyword } => {
            service.count_words(&doc, &keyword).await.map(RpcReply::Count)
        }
    };

    result.unwrap_or_else(|e| RpcReply::Error(e.to_string()))
}

/// Answer requests on one stream until the peer closes it.
pub async fn serve_connection<S, W>(stream: S, service: &W) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    W: WordCount,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(request) => {
                debug!(?request, "Request");
                dispatch(service, request).await
            }
            Err(e) => RpcReply::Error(format!("bad request: {e}")),
        };

        let mut out = serde_json::to_vec(&reply).map_err(io::Error::other)?;
        out.push(b'\n');
        writer.write_all(&out).await?;
        writer.flush().await?;
    }

    Ok(())
}

/// Accept connections forever, one task per connection.
pub async fn serve<W>(listener: TcpListener, service: Arc<W>) -> io::Result<()>
where
    W: WordCount + Send + Sync + 'static,
{
    info!(addr = %listener.local_addr()?, "Word-count service listening");

    loop {
        let (socket, peer) = listener.accept().await?;
        let service = Arc::clone(&service);

        tokio::spawn(
            async move {
                if let Err(e) = serve_connection(socket, service.as_ref()).await {
                    warn!(error = %e, "Connection error");
                }
            }
            .instrument(tracing::info_span!("rpc", peer = %peer)),
        );
    }
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Client stub for a remote [`WordCount`] service.
///
/// Calls on one client are serialized over its single connection.
pub struct WordCountClient {
    conn: Mutex<Connection>,
}

impl WordCountClient {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();

        Self {
            conn: Mutex::new(Connection {
                reader: BufReader::new(reader),
                writer,
            }),
        }
    }

    async fn call(&self, request: RpcRequest) -> Result<RpcReply, WordCountError> {
        let started = Instant::now();
        let mut conn = self.conn.lock().await;

        let mut out = serde_json::to_vec(&request).map_err(|e| WordCountError::Protocol(e.to_string()))?;
        out.push(b'\n');
        conn.writer.write_all(&out).await?;
        conn.writer.flush().await?;

        let mut line = String::new();
        if conn.reader.read_line(&mut line).await? == 0 {
            return Err(WordCountError::Protocol("connection closed by server".into()));
        }

        let reply: RpcReply =
            serde_json::from_str(&line).map_err(|e| WordCountError::Protocol(e.to_string()))?;

        debug!(
            ?request,
            elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
            "RPC call finished"
        );

        match reply {
            RpcReply::Error(msg) => Err(WordCountError::Remote(msg)),
            other => Ok(other),
        }
    }

    /// Close the write side so the server sees EOF.
    pub async fn close(&self) -> io::Result<()> {
        self.conn.lock().await.writer.shutdown().await
    }
}

impl WordCount for WordCountClient {
    async fn list_docs(&self) -> Result<Vec<String>, WordCountError> {
        match self.call(RpcRequest::ListDocs).await? {
            RpcReply::Docs(docs) => Ok(docs),
            other => Err(unexpected(&other)),
        }
    }

    async fn count_words(&self, doc: &str, keyword: &str) -> Result<CountWordsResponse, WordCountError> {
        let request = RpcRequest::CountWords {
            doc: doc.to_string(),
            keyword: keyword.to_string(),
        };

        match self.call(request).await? {
            RpcReply::Count(response) => Ok(response),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(reply: &RpcReply) -> WordCountError {
    WordCountError::Protocol(format!("unexpected reply {reply:?}"))
}
