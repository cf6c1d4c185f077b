use std::sync::Arc;

use encoding_rs::Encoding;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::ProcessError;
use crate::util::RingBytes;

/// One decoded stdout line, newline stripped.
#[derive(Debug)]
pub struct LineTap {
    pub line: String,
}

/// Pump a worker's stdout: raw bytes feed the ring tail, complete lines are
/// decoded with `encoding` and forwarded over `line_tx`. Returns the total
/// byte count on EOF.
pub fn pump_stdout<R>(
    mut rd: R,
    ring: Arc<RingBytes>,
    line_tx: mpsc::Sender<LineTap>,
    encoding: &'static Encoding,
) -> JoinHandle<Result<u64, ProcessError>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; 16 * 1024];
        let mut total = 0u64;
        let mut line_buf: Vec<u8> = Vec::with_capacity(8 * 1024);

        loop {
            let n = rd.read(&mut buf).await.map_err(|e| ProcessError::StreamIo {
                stream: "stdout",
                source: e,
            })?;
            if n == 0 {
                break;
            }

            ring.push(&buf[..n]);
            total += n as u64;

            line_buf.extend_from_slice(&buf[..n]);
            while let Some(pos) = line_buf.iter().position(|&b| b == b'\n') {
                let mut one = line_buf.drain(..=pos).collect::<Vec<u8>>();
                trim_newline(&mut one);
                let (line, _, _) = encoding.decode(&one);
                let _ = line_tx
                    .send(LineTap {
                        line: line.into_owned(),
                    })
                    .await;
            }
        }

        // EOF flush: deliver the last partial line if it doesn't end with '\n'.
        if !line_buf.is_empty() {
            trim_newline(&mut line_buf);
            if !line_buf.is_empty() {
                let (line, _, _) = encoding.decode(&line_buf);
                let _ = line_tx
                    .send(LineTap {
                        line: line.into_owned(),
                    })
                    .await;
            }
        }

        Ok(total)
    })
}

fn trim_newline(buf: &mut Vec<u8>) {
    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
}
