//! Destinations for decoded readings.
//!
//! | Sink | Line format |
//! |---|---|
//! | [`RawSink`] | `ts,device,b0,b1,b2,b3,b4` (undecoded frame bytes) |
//! | [`CsvSink`] | header once, then one decoded [`ReadingRecord`] per line |
//! | [`JsonSink`] | one JSON object per line |
//! | [`ChannelSink`] | no text; records are sent over a tokio channel |

use std::io::{self, Write};

use tokio::sync::mpsc;

use crate::types::ReadingRecord;

/// Receives every reading the supervisor decodes.
///
/// An error ends the supervisor: a sink that can no longer accept output
/// makes further streaming pointless.
pub trait ReadingSink: Send {
    fn emit(&mut self, record: &ReadingRecord) -> io::Result<()>;
}

impl<S: ReadingSink + ?Sized> ReadingSink for Box<S> {
    fn emit(&mut self, record: &ReadingRecord) -> io::Result<()> {
        (**self).emit(record)
    }
}

/// Writes the frame's raw bytes, the compact line format used by the
/// device's reference logger.
pub struct RawSink<W> {
    out: W,
}

impl<W: Write + Send> RawSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write + Send> ReadingSink for RawSink<W> {
    fn emit(&mut self, record: &ReadingRecord) -> io::Result<()> {
        let raw = &record.raw;
        writeln!(
            self.out,
            "{},{},{},{},{},{},{}",
            record.ts, record.device_id, raw[0], raw[1], raw[2], raw[3], raw[4]
        )?;
        self.out.flush()
    }
}

/// Column order of [`CsvSink`] output.
pub const CSV_HEADER: &str = "ts,device_id,signal_strength,no_signal,probe_unplugged,pulse_beep,\
pleth,bar_graph,no_finger,pulse_research,pulse_rate,spo2";

/// Writes decoded records as CSV, emitting [`CSV_HEADER`] before the first.
pub struct CsvSink<W> {
    out: W,
    header_written: bool,
}

impl<W: Write + Send> CsvSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            header_written: false,
        }
    }
}

impl<W: Write + Send> ReadingSink for CsvSink<W> {
    fn emit(&mut self, r: &ReadingRecord) -> io::Result<()> {
        if !self.header_written {
            writeln!(self.out, "{CSV_HEADER}")?;
            self.header_written = true;
        }
        writeln!(
            self.out,
            "{},{},{},{},{},{},{},{},{},{},{},{}",
            r.ts,
            r.device_id,
            r.signal_strength,
            r.no_signal,
            r.probe_unplugged,
            r.pulse_beep,
            r.pleth,
            r.bar_graph,
            r.no_finger,
            r.pulse_research,
            r.pulse_rate,
            r.spo2
        )?;
        self.out.flush()
    }
}

/// Writes one JSON object per line.
pub struct JsonSink<W> {
    out: W,
}

impl<W: Write + Send> JsonSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write + Send> ReadingSink for JsonSink<W> {
    fn emit(&mut self, record: &ReadingRecord) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }
}

/// Forwards records to an in-process consumer.
///
/// Fails with [`io::ErrorKind::BrokenPipe`] once the receiver is dropped.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ReadingRecord>,
}

impl ChannelSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ReadingRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ReadingSink for ChannelSink {
    fn emit(&mut self, record: &ReadingRecord) -> io::Result<()> {
        self.tx
            .send(record.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "reading receiver dropped"))
    }
}
