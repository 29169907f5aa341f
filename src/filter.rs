//! Filter Engine
//!
//! A `Filter` stands in for a child process's stdout or stderr. Writes land
//! in a ring buffer and return immediately; one background thread pulls
//! complete records out of the buffer, runs each through the interpreter
//! chain, and hands the resulting fields to the sink.
//!
//! Records reach the sink in stream order, one at a time: the next record
//! is not touched until the sink has returned for the previous one.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;
use log::{debug, trace, warn};
use thiserror::Error;

use crate::config::{ConfigError, FilterConfig};
use crate::interpreters::{FieldSet, Interpreter, InterpreterChain};
use crate::streaming::{RingBuffer, RingBufferError, Split, TokenizeError, Tokenizer};
use crate::telemetry::Diagnostic;

const CONSUMER_THREAD_NAME: &str = "stdio-filter";

/// Filter construction and shutdown errors
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to spawn consumer thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("consumer thread panicked")]
    ConsumerPanicked,
}

/// Writer that turns a raw output stream into structured records
#[derive(Debug)]
pub struct Filter {
    buffer: Arc<RingBuffer>,
    consumer: Option<JoinHandle<()>>,
}

impl Filter {
    /// Build a filter with the default buffer settings
    pub fn new<S>(
        tokenizer: Tokenizer,
        sink: S,
        interpreters: Vec<Box<dyn Interpreter>>,
    ) -> Result<Self, FilterError>
    where
        S: FnMut(FieldSet) + Send + 'static,
    {
        let config = FilterConfig {
            tokenizer,
            ..FilterConfig::default()
        };
        Self::from_config(&config, sink, interpreters)
    }

    /// Filter for processes that emit a stream of JSON objects
    pub fn json<S>(sink: S, interpreters: Vec<Box<dyn Interpreter>>) -> Result<Self, FilterError>
    where
        S: FnMut(FieldSet) + Send + 'static,
    {
        Self::new(Tokenizer::Object, sink, interpreters)
    }

    /// Filter for processes that emit lines of text
    pub fn lines<S>(sink: S, interpreters: Vec<Box<dyn Interpreter>>) -> Result<Self, FilterError>
    where
        S: FnMut(FieldSet) + Send + 'static,
    {
        Self::new(Tokenizer::Line, sink, interpreters)
    }

    /// Allocate the buffer and start the consumer thread
    pub fn from_config<S>(
        config: &FilterConfig,
        sink: S,
        interpreters: Vec<Box<dyn Interpreter>>,
    ) -> Result<Self, FilterError>
    where
        S: FnMut(FieldSet) + Send + 'static,
    {
        config.validate()?;

        let buffer = Arc::new(RingBuffer::with_policy(
            config.buffer_capacity,
            config.growth_policy,
        ));
        let consumer = Consumer {
            buffer: Arc::clone(&buffer),
            tokenizer: config.tokenizer,
            chain: InterpreterChain::new(interpreters),
            sink,
        };
        let signal = buffer.listen();

        let handle = thread::Builder::new()
            .name(CONSUMER_THREAD_NAME.to_string())
            .spawn(move || consumer.run(signal))
            .map_err(FilterError::Spawn)?;

        Ok(Self {
            buffer,
            consumer: Some(handle),
        })
    }

    /// Append raw output. Never waits for the consumer.
    pub fn write_bytes(&self, data: &[u8]) -> Result<usize, RingBufferError> {
        self.buffer.write(data).map_err(|e| {
            match e {
                RingBufferError::EndOfStream => {
                    debug!("Write of {} bytes after close", data.len())
                }
                _ => warn!("Dropped write of {} bytes: {}", data.len(), e),
            }
            e
        })
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.buffer.is_closed()
    }

    /// Stop accepting writes. The consumer delivers what is already
    /// buffered, then exits.
    pub fn close(&self) {
        self.buffer.close();
    }

    /// Close and wait until every buffered record has reached the sink
    pub fn shutdown(mut self) -> Result<(), FilterError> {
        self.buffer.close();
        match self.consumer.take() {
            Some(handle) => handle.join().map_err(|_| FilterError::ConsumerPanicked),
            None => Ok(()),
        }
    }
}

impl Drop for Filter {
    fn drop(&mut self) {
        // Detaches the consumer; it exits on its own once drained.
        self.buffer.close();
    }
}

impl io::Write for Filter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Write for &Filter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Closes the buffer when the consumer exits, including by unwinding out of
/// the sink. Producers then get `EndOfStream` instead of filling a buffer
/// nobody reads.
struct CloseOnExit(Arc<RingBuffer>);

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        if thread::panicking() {
            warn!(
                "Filter consumer panicked, closing with {} bytes undelivered",
                self.0.len()
            );
        }
        self.0.close();
    }
}

/// State owned by the background thread
struct Consumer<S> {
    buffer: Arc<RingBuffer>,
    tokenizer: Tokenizer,
    chain: InterpreterChain,
    sink: S,
}

impl<S> Consumer<S>
where
    S: FnMut(FieldSet),
{
    fn run(mut self, signal: Receiver<()>) {
        let _close = CloseOnExit(Arc::clone(&self.buffer));
        debug!(
            "Filter consumer started ({:?} tokenizer, {} interpreters)",
            self.tokenizer,
            self.chain.len()
        );

        let mut delivered = 0u64;
        while signal.recv().is_ok() {
            delivered += self.drain();
        }
        // Disconnected: the buffer is closed, so what is left is final
        delivered += self.drain();

        debug!("Filter consumer stopped after {} records", delivered);
    }

    /// Deliver every complete record currently buffered. Returns how many
    /// records reached the sink.
    fn drain(&mut self) -> u64 {
        let window = self.buffer.window();
        let mut offset = 0;
        let mut delivered = 0;

        loop {
            let rest = &window.bytes[offset..];
            match self.tokenizer.split(rest, window.closed) {
                Ok(Split::Incomplete) => break,
                Ok(Split::Skip(n)) => {
                    trace!("Skipping {} bytes of noise", n);
                    self.buffer.consume(n);
                    offset += n;
                }
                Ok(Split::Token { consumed, token }) => {
                    self.buffer.consume(consumed);
                    offset += consumed;

                    trace!("Record of {} bytes", token.len());
                    let fields = self.chain.interpret(token);
                    (self.sink)(fields);
                    delivered += 1;
                }
                Err(e) => {
                    (self.sink)(Diagnostic::engine_error(&e.to_string()).emit());
                    delivered += 1;

                    if !window.closed {
                        break;
                    }
                    // Nothing can arrive to match this brace; drop through it
                    // and look for a later complete object.
                    let TokenizeError::IncompleteObject { start } = e;
                    self.buffer.consume(start + 1);
                    offset += start + 1;
                }
            }
        }

        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreters::{JsonInterpreter, LastChanceInterpreter};
    use crate::streaming::GrowthPolicy;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::io::Write;
    use std::time::{Duration, Instant};

    type Records = Arc<Mutex<Vec<FieldSet>>>;

    fn collector() -> (Records, impl FnMut(FieldSet) + Send + 'static) {
        let records: Records = Arc::new(Mutex::new(Vec::new()));
        let sink_records = Arc::clone(&records);
        (records, move |fields| sink_records.lock().push(fields))
    }

    fn values(records: &Records) -> Vec<Value> {
        records.lock().iter().cloned().map(Value::Object).collect()
    }

    #[test]
    fn test_lines_without_interpreters() {
        let (records, sink) = collector();
        let filter = Filter::lines(sink, vec![]).unwrap();

        filter.write_bytes(b"line1\nline2\n").unwrap();
        filter.shutdown().unwrap();

        let records = records.lock();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|fields| fields.is_empty()));
    }

    #[test]
    fn test_json_records_split_across_writes() {
        let (records, sink) = collector();
        let mut filter = Filter::json(sink, vec![Box::new(JsonInterpreter)]).unwrap();

        filter.write_all(b"startup noise {\"seq\":1,\"msg\":\"a }").unwrap();
        filter.write_all(b" b\"}\n{\"seq\":").unwrap();
        filter.write_all(b"2}\n{\"seq\":3,\"nested\":{\"k\":\"{\"}}\n").unwrap();
        filter.shutdown().unwrap();

        assert_eq!(
            values(&records),
            vec![
                json!({"seq": 1, "msg": "a } b"}),
                json!({"seq": 2}),
                json!({"seq": 3, "nested": {"k": "{"}}),
            ]
        );
    }

    #[test]
    fn test_unterminated_object_reports_diagnostic() {
        let (records, sink) = collector();
        let filter = Filter::json(sink, vec![Box::new(JsonInterpreter)]).unwrap();

        filter.write_bytes(b"{\"ok\":true}{\"a\":").unwrap();
        filter.shutdown().unwrap();

        assert_eq!(
            values(&records),
            vec![
                json!({"ok": true}),
                json!({
                    "source": "filter engine",
                    "severity": "error",
                    "message": "incomplete object"
                }),
            ]
        );
    }

    #[test]
    fn test_object_nested_in_unterminated_one_is_recovered() {
        let (records, sink) = collector();
        let filter = Filter::json(sink, vec![Box::new(JsonInterpreter)]).unwrap();

        filter.write_bytes(b"{\"x\": {\"ok\":1}").unwrap();
        filter.shutdown().unwrap();

        assert_eq!(
            values(&records),
            vec![
                json!({
                    "source": "filter engine",
                    "severity": "error",
                    "message": "incomplete object"
                }),
                json!({"ok": 1}),
            ]
        );
    }

    #[test]
    fn test_panicking_sink_closes_buffer() {
        let filter = Filter::lines(|_| panic!("sink failure"), vec![]).unwrap();
        filter.write_bytes(b"first\n").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !filter.is_closed() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        assert!(filter.is_closed());
        assert_eq!(
            filter.write_bytes(b"second\n"),
            Err(RingBufferError::EndOfStream)
        );
        assert!(matches!(
            filter.shutdown(),
            Err(FilterError::ConsumerPanicked)
        ));
    }

    #[test]
    fn test_order_is_preserved() {
        let (records, sink) = collector();
        let filter = Filter::json(sink, vec![Box::new(JsonInterpreter)]).unwrap();

        let stream: Vec<u8> = (0..500)
            .flat_map(|i| format!("{{\"seq\":{}}}\n", i).into_bytes())
            .collect();
        // Odd chunk size so records straddle writes
        for chunk in stream.chunks(7) {
            filter.write_bytes(chunk).unwrap();
        }
        filter.shutdown().unwrap();

        let seqs: Vec<u64> = records
            .lock()
            .iter()
            .map(|f| f["seq"].as_u64().unwrap())
            .collect();
        assert_eq!(seqs, (0..500).collect::<Vec<u64>>());
    }

    #[test]
    fn test_concurrent_producers() {
        let (records, sink) = collector();
        let filter = Arc::new(
            Filter::lines(sink, vec![Box::new(LastChanceInterpreter::default())]).unwrap(),
        );

        let handles: Vec<_> = (0..4)
            .map(|id| {
                let filter = Arc::clone(&filter);
                thread::spawn(move || {
                    for n in 0..100 {
                        filter
                            .write_bytes(format!("worker {} line {}\n", id, n).as_bytes())
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let filter = Arc::try_unwrap(filter).unwrap();
        filter.shutdown().unwrap();

        let records = records.lock();
        assert_eq!(records.len(), 400);
        for fields in records.iter() {
            let raw = hex::decode(fields["_other"].as_str().unwrap()).unwrap();
            let line = String::from_utf8(raw).unwrap();
            assert!(line.starts_with("worker "), "torn record: {:?}", line);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_writes_from_async_tasks() {
        let (records, sink) = collector();
        let filter = Arc::new(Filter::json(sink, vec![Box::new(JsonInterpreter)]).unwrap());

        let mut tasks = Vec::new();
        for task in 0..8 {
            let filter = Arc::clone(&filter);
            tasks.push(tokio::spawn(async move {
                for n in 0..25 {
                    let record = json!({"task": task, "n": n}).to_string();
                    filter.write_bytes(record.as_bytes()).unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let filter = Arc::try_unwrap(filter).unwrap();
        filter.shutdown().unwrap();

        assert_eq!(records.lock().len(), 200);
    }

    #[test]
    fn test_write_after_close() {
        let (_records, sink) = collector();
        let mut filter = Filter::lines(sink, vec![]).unwrap();

        filter.close();
        assert!(filter.is_closed());
        assert_eq!(filter.write_bytes(b"late\n"), Err(RingBufferError::EndOfStream));

        let err = filter.write(b"late\n").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_fail_fast_rejects_oversized_write() {
        let (records, sink) = collector();
        let config = FilterConfig {
            buffer_capacity: 8,
            tokenizer: Tokenizer::Line,
            growth_policy: GrowthPolicy::FailFast,
        };
        let filter = Filter::from_config(&config, sink, vec![]).unwrap();

        assert!(matches!(
            filter.write_bytes(b"much too long\n"),
            Err(RingBufferError::InsufficientCapacity { .. })
        ));
        assert_eq!(filter.capacity(), 8);

        filter.write_bytes(b"short\n").unwrap();
        filter.shutdown().unwrap();
        assert_eq!(records.lock().len(), 1);
    }

    #[test]
    fn test_auto_grow_accepts_oversized_write() {
        let (records, sink) = collector();
        let config = FilterConfig {
            buffer_capacity: 4,
            tokenizer: Tokenizer::Line,
            growth_policy: GrowthPolicy::AutoGrow,
        };
        let filter = Filter::from_config(
            &config,
            sink,
            vec![Box::new(LastChanceInterpreter::default())],
        )
        .unwrap();

        filter.write_bytes(b"a line longer than four bytes\n").unwrap();
        filter.shutdown().unwrap();

        let records = records.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0]["_other"],
            json!(hex::encode("a line longer than four bytes"))
        );
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let (_records, sink) = collector();
        let config = FilterConfig {
            buffer_capacity: 0,
            ..FilterConfig::default()
        };
        assert!(matches!(
            Filter::from_config(&config, sink, vec![]),
            Err(FilterError::Config(ConfigError::ZeroCapacity))
        ));
    }

    #[test]
    fn test_noise_only_produces_nothing() {
        let (records, sink) = collector();
        let filter = Filter::json(sink, vec![]).unwrap();

        filter.write_bytes(b"plain text with no objects\n").unwrap();
        filter.shutdown().unwrap();

        assert!(records.lock().is_empty());
    }

    #[test]
    fn test_final_line_without_newline() {
        let (records, sink) = collector();
        let filter =
            Filter::lines(sink, vec![Box::new(LastChanceInterpreter::default())]).unwrap();

        filter.write_bytes(b"done\nno newline").unwrap();
        filter.shutdown().unwrap();

        assert_eq!(
            values(&records),
            vec![
                json!({"_other": hex::encode("done")}),
                json!({"_other": hex::encode("no newline")}),
            ]
        );
    }

    #[test]
    fn test_drop_drains_in_background() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let filter = Filter::lines(
            move |fields| {
                let _ = tx.send(fields);
            },
            vec![],
        )
        .unwrap();

        filter.write_bytes(b"one\ntwo").unwrap();
        drop(filter);

        let timeout = Duration::from_secs(5);
        assert!(rx.recv_timeout(timeout).is_ok());
        assert!(rx.recv_timeout(timeout).is_ok());
        // Consumer exited and dropped the sink
        assert!(rx.recv_timeout(timeout).is_err());
    }
}
