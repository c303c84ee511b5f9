// Line protocol spoken between the parent process and its worker processes.
//
// Messages travel as single lines of JSON over the child's stdin (parent to child) and stdout
// (child to parent). Protocol lines carry a fixed prefix so that anything else the worker
// happens to print to stdout can be told apart and passed through.

use std::io::{self, BufRead, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Error, WorkerIdentity};

/// Environment variable that tells a process it was started as a worker process.
pub(crate) const WORKER_ENV: &str = "SHOOTOUT_WORKER";

const LINE_PREFIX: &str = "@shootout ";

#[derive(Debug, Deserialize, Serialize)]
pub(crate) enum ToChild {
    Start {
        task: String,
        identity: WorkerIdentity,
        payload: serde_json::Value,
    },
    Release,
    Abort(Error),
}

#[derive(Debug, Deserialize, Serialize)]
pub(crate) enum ToParent {
    Arrive,
    Finished(Result<serde_json::Value, Error>),
}

pub(crate) fn send<W, M>(writer: &mut W, message: &M) -> io::Result<()>
where
    W: Write + ?Sized,
    M: Serialize,
{
    let json = serde_json::to_string(message).map_err(io::Error::other)?;
    writeln!(writer, "{LINE_PREFIX}{json}")?;
    writer.flush()
}

/// Reads the next protocol message, handing every non-protocol line to `passthrough`.
///
/// Returns `Ok(None)` once the other side has closed the channel.
pub(crate) fn receive<R, M>(reader: &mut R, mut passthrough: impl FnMut(&str)) -> io::Result<Option<M>>
where
    R: BufRead + ?Sized,
    M: DeserializeOwned,
{
    let mut line = String::new();

    loop {
        line.clear();

        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }

        let line = line.trim_end_matches(['\r', '\n']);

        match line.strip_prefix(LINE_PREFIX) {
            Some(json) => {
                return serde_json::from_str(json)
                    .map(Some)
                    .map_err(io::Error::other);
            }
            None => passthrough(line),
        }
    }
}
