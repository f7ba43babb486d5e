//! Delivery of status frames to their consumers.
//!
//! A sink failure is logged and never stops the measurement loop.

use anyhow::{bail, Context, Result};
use std::cell::RefCell;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::rc::Rc;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::output::StatusFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// `c:e:d:t0:t1:t2\n`
    Line,
    /// One byte per emission
    Packed,
}

impl FromStr for Protocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "line" => Ok(Protocol::Line),
            "packed" => Ok(Protocol::Packed),
            other => bail!("unknown protocol {other:?}, expected \"line\" or \"packed\""),
        }
    }
}

pub trait StatusSink {
    fn name(&self) -> &str;

    fn transmit(&mut self, frame: &StatusFrame) -> Result<()>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Logs every emission with the binary breakdown.
#[derive(Debug, Default)]
pub struct LogSink;

impl StatusSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn transmit(&mut self, frame: &StatusFrame) -> Result<()> {
        info!("📤 {}", frame.word.summary());
        Ok(())
    }
}

/// Writes status records to any byte stream: a serial device, a file, stdout.
pub struct WriterSink<W: Write> {
    name: String,
    protocol: Protocol,
    writer: Option<W>,
}

impl<W: Write> WriterSink<W> {
    pub fn new(name: impl Into<String>, writer: W, protocol: Protocol) -> Self {
        Self {
            name: name.into(),
            protocol,
            writer: Some(writer),
        }
    }
}

impl<W: Write> StatusSink for WriterSink<W> {
    fn name(&self) -> &str {
        &self.name
    }

    fn transmit(&mut self, frame: &StatusFrame) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            bail!("sink {} is closed", self.name);
        };
        match self.protocol {
            Protocol::Line => writer.write_all(frame.line.as_bytes())?,
            Protocol::Packed => writer.write_all(&[frame.packed])?,
        }
        writer.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            debug!("Sink {} closed", self.name);
        }
        Ok(())
    }
}

/// Opens a character device (e.g. `/dev/ttyACM0`) or plain file for writing.
/// Line settings of a serial port are left to the host.
pub fn open_device<P: AsRef<Path>>(
    path: P,
    protocol: Protocol,
) -> Result<WriterSink<std::fs::File>> {
    let path = path.as_ref();
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .append(true)
        .open(path)
        .with_context(|| format!("opening status device {}", path.display()))?;
    info!("Status device {} opened ({:?} protocol)", path.display(), protocol);
    Ok(WriterSink::new(path.display().to_string(), file, protocol))
}

/// Keeps every frame it receives. Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    frames: Rc<RefCell<Vec<StatusFrame>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<StatusFrame> {
        self.frames.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.frames.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.borrow().is_empty()
    }
}

impl StatusSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    fn transmit(&mut self, frame: &StatusFrame) -> Result<()> {
        self.frames.borrow_mut().push(frame.clone());
        Ok(())
    }
}

/// Fans each status frame out to all registered sinks.
#[derive(Default)]
pub struct StatusTransmitter {
    sinks: Vec<Box<dyn StatusSink>>,
    sent: u64,
    failures: u64,
    closed: bool,
}

impl StatusTransmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: impl StatusSink + 'static) -> Self {
        self.add_sink(sink);
        self
    }

    pub fn add_sink(&mut self, sink: impl StatusSink + 'static) {
        debug!("Registered status sink {}", sink.name());
        self.sinks.push(Box::new(sink));
    }

    pub fn send(&mut self, frame: &StatusFrame) {
        if self.closed {
            warn!("Status transmitter already closed, dropping frame");
            return;
        }
        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.transmit(frame) {
                self.failures += 1;
                warn!("Sink {} failed to transmit: {:#}", sink.name(), e);
            }
        }
        self.sent += 1;
    }

    /// Closes every sink once. Later calls are no-ops.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.close() {
                warn!("Sink {} failed to close: {:#}", sink.name(), e);
            }
        }
        self.closed = true;
        info!(
            "Status transmitter closed after {} frames ({} sink failures)",
            self.sent, self.failures
        );
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::BoxType;
    use crate::output::StatusWord;

    struct FailingSink;

    impl StatusSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        fn transmit(&mut self, _frame: &StatusFrame) -> Result<()> {
            bail!("device unplugged")
        }
    }

    fn frame() -> StatusFrame {
        StatusFrame::from(StatusWord::new(true, false, true, BoxType::TwentyByTwenty))
    }

    #[test]
    fn protocol_parses_names() {
        assert_eq!("line".parse::<Protocol>().unwrap(), Protocol::Line);
        assert_eq!("packed".parse::<Protocol>().unwrap(), Protocol::Packed);
        assert!("json".parse::<Protocol>().is_err());
    }

    #[test]
    fn writer_sink_uses_selected_protocol() {
        let mut line = WriterSink::new("line", Vec::new(), Protocol::Line);
        line.transmit(&frame()).unwrap();
        assert_eq!(line.writer.as_deref(), Some(b"1:0:1:0:1:0\n".as_slice()));

        let mut packed = WriterSink::new("packed", Vec::new(), Protocol::Packed);
        packed.transmit(&frame()).unwrap();
        assert_eq!(packed.writer.as_deref(), Some([0b0001_0101u8].as_slice()));
    }

    #[test]
    fn closed_writer_rejects_frames() {
        let mut sink = WriterSink::new("buf", Vec::new(), Protocol::Line);
        sink.close().unwrap();
        assert!(sink.transmit(&frame()).is_err());
    }

    #[test]
    fn failing_sink_does_not_block_others() {
        let recording = RecordingSink::new();
        let mut transmitter = StatusTransmitter::new()
            .with_sink(FailingSink)
            .with_sink(recording.clone());

        transmitter.send(&frame());
        transmitter.send(&frame());
        assert_eq!(recording.len(), 2);
        assert_eq!(transmitter.failures(), 2);
        assert_eq!(transmitter.sent(), 2);
    }

    #[test]
    fn close_is_idempotent_and_stops_delivery() {
        let recording = RecordingSink::new();
        let mut transmitter = StatusTransmitter::new().with_sink(recording.clone());
        transmitter.close();
        transmitter.close();
        transmitter.send(&frame());
        assert!(recording.is_empty());
        assert!(transmitter.is_closed());
    }

    #[test]
    fn device_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tty");
        let mut sink = open_device(&path, Protocol::Line).unwrap();
        sink.transmit(&frame()).unwrap();
        sink.transmit(&StatusFrame::from(StatusWord::failure())).unwrap();
        sink.close().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "1:0:1:0:1:0\n0:1:0:0:0:0\n");
    }
}
