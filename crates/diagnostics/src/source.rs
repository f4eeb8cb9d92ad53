use std::fs::File;
use std::io::{self, BufRead, BufReader, Cursor};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

/// An open log, plus the process producing it when there is one.
pub struct LogStream {
    reader: Box<dyn BufRead + Send>,
    child: Option<Child>,
}

impl LogStream {
    pub fn new(reader: Box<dyn BufRead + Send>) -> Self {
        Self {
            reader,
            child: None,
        }
    }

    pub fn with_child(reader: Box<dyn BufRead + Send>, child: Child) -> Self {
        Self {
            reader,
            child: Some(child),
        }
    }
}

/// Producer of raw log lines. Finite sources end; live tails do not.
/// Re-opening restarts from the source's beginning (or from "now" for a tail).
pub trait LogSource: Send {
    fn name(&self) -> &str;
    fn open(&mut self) -> io::Result<LogStream>;
}

/// A block of text captured earlier.
pub struct CapturedLog {
    name: String,
    text: String,
}

impl CapturedLog {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }
}

impl LogSource for CapturedLog {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> io::Result<LogStream> {
        Ok(LogStream::new(Box::new(Cursor::new(
            self.text.clone().into_bytes(),
        ))))
    }
}

pub struct FileLog {
    path: PathBuf,
    name: String,
}

impl FileLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        Self { path, name }
    }
}

impl LogSource for FileLog {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> io::Result<LogStream> {
        Ok(LogStream::new(Box::new(BufReader::new(File::open(
            &self.path,
        )?))))
    }
}

/// Live tail of a command's stdout, such as `logcat -v threadtime`.
pub struct CommandLog {
    name: String,
    program: String,
    args: Vec<String>,
}

impl CommandLog {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        let program = program.into();
        let name = std::iter::once(program.clone())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            name,
            program,
            args,
        }
    }

    pub fn logcat() -> Self {
        Self::new("logcat", vec!["-v".to_string(), "threadtime".to_string()])
    }
}

impl LogSource for CommandLog {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> io::Result<LogStream> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "no stdout from log command"))?;
        Ok(LogStream::with_child(Box::new(BufReader::new(stdout)), child))
    }
}

/// Background reader delivering lines over a channel. Dropping it kills the
/// producing process so the reader thread sees end of input.
pub(crate) struct LogPump {
    lines: Receiver<String>,
    child: Option<Child>,
}

impl LogPump {
    pub fn spawn(stream: LogStream) -> Self {
        let LogStream { mut reader, child } = stream;
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf)
                            .trim_end_matches(['\r', '\n'])
                            .to_string();
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        tracing::warn!(error = %err, "log stream read failed");
                        break;
                    }
                }
            }
        });
        Self { lines: rx, child }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<String, RecvTimeoutError> {
        self.lines.recv_timeout(timeout)
    }
}

impl Drop for LogPump {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
