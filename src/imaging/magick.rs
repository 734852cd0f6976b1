//! ImageMagick driver, driven through the `magick` command-line tool.
//!
//! Source bytes go in on stdin and the encoded image comes back on stdout,
//! so no temporary files are written. ImageMagick enforces its own resource
//! policy (`policy.xml`); [`Driver::live_limit`] reports it by parsing
//! `magick -list resource`, which lets the admission check reject an image
//! before ImageMagick would abort half-way through a decode.
//!
//! ```text
//! magick -[0] -resize 800x600! -quality 82 -strip webp:-
//! ```

use super::calculations::Dimensions;
use super::driver::{Driver, DriverError, DriverId, LimitKind};
use super::format::Format;
use super::params::EncodeRequest;
use crate::config::ImagickConfig;
use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Resource ceilings reported by `magick -list resource`.
///
/// `None` means "unlimited" or not listed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceListing {
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub area: Option<u64>,
    pub memory: Option<u64>,
}

impl ResourceListing {
    pub fn get(&self, kind: LimitKind) -> Option<u64> {
        match kind {
            LimitKind::Width => self.width,
            LimitKind::Height => self.height,
            LimitKind::Area => self.area,
            LimitKind::Memory => self.memory,
        }
    }
}

/// ImageMagick CLI driver.
pub struct ImagickDriver {
    binary: String,
    timeout: Option<Duration>,
    /// `-list resource` is read once; the policy cannot change under a
    /// running process.
    resources: OnceLock<Result<ResourceListing, String>>,
}

impl ImagickDriver {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            timeout: None,
            resources: OnceLock::new(),
        }
    }

    pub fn from_config(config: &ImagickConfig) -> Self {
        Self {
            timeout: config.timeout_secs.map(Duration::from_secs),
            ..Self::new(config.binary.clone())
        }
    }

    /// Run the binary, feeding `input` on stdin, and collect its output.
    fn run(&self, args: &[String], input: Option<&[u8]>) -> Result<CommandOutput, DriverError> {
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    DriverError::NotAvailable(format!("{} not found on PATH", self.binary))
                }
                _ => DriverError::Io(e),
            })?;

        let stdin = child.stdin.take();
        let mut stdout = child.stdout.take().ok_or_else(|| {
            DriverError::Io(std::io::Error::other("stdout pipe missing"))
        })?;
        let mut stderr = child.stderr.take().ok_or_else(|| {
            DriverError::Io(std::io::Error::other("stderr pipe missing"))
        })?;

        // Pipes are drained on their own threads so a large image cannot
        // deadlock against a full stdout buffer.
        std::thread::scope(|scope| {
            if let (Some(mut pipe), Some(data)) = (stdin, input) {
                scope.spawn(move || {
                    // A write error here means the child exited early; its
                    // status and stderr carry the real failure.
                    let _ = pipe.write_all(data);
                });
            }
            let out_reader = scope.spawn(move || {
                let mut buf = Vec::new();
                stdout.read_to_end(&mut buf).map(|_| buf)
            });
            let err_reader = scope.spawn(move || {
                let mut buf = Vec::new();
                stderr.read_to_end(&mut buf).map(|_| buf)
            });

            let status = self.wait(&mut child)?;
            let stdout = join_reader(out_reader.join())?;
            let stderr = join_reader(err_reader.join())?;
            Ok(CommandOutput {
                status,
                stdout,
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        })
    }

    fn wait(&self, child: &mut Child) -> Result<ExitStatus, DriverError> {
        let Some(timeout) = self.timeout else {
            return Ok(child.wait()?);
        };
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(DriverError::TimedOut(timeout));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn resources(&self) -> &Result<ResourceListing, String> {
        self.resources.get_or_init(|| {
            let output = self
                .run(&["-list".to_string(), "resource".to_string()], None)
                .map_err(|e| e.to_string())?;
            if !output.status.success() {
                return Err(output.stderr.trim().to_string());
            }
            Ok(parse_resource_listing(&String::from_utf8_lossy(
                &output.stdout,
            )))
        })
    }
}

struct CommandOutput {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: String,
}

fn join_reader(
    joined: std::thread::Result<std::io::Result<Vec<u8>>>,
) -> Result<Vec<u8>, DriverError> {
    match joined {
        Ok(result) => Ok(result?),
        Err(_) => Err(DriverError::Io(std::io::Error::other(
            "pipe reader thread panicked",
        ))),
    }
}

/// ImageMagick coder name for an output format.
fn coder(format: Format) -> &'static str {
    match format {
        Format::Webp => "WEBP",
        Format::Avif => "AVIF",
        Format::Jpeg => "JPEG",
        Format::Png => "PNG",
        Format::Gif => "GIF",
        Format::Bmp => "BMP",
        Format::Tiff => "TIFF",
    }
}

/// Arguments for one encode. `-[0]` reads only the first frame from stdin
/// and the `!` suffix resizes to the exact, already aspect-correct target.
pub fn encode_args(request: &EncodeRequest) -> Vec<String> {
    vec![
        "-[0]".to_string(),
        "-resize".to_string(),
        format!("{}x{}!", request.target.width, request.target.height),
        "-quality".to_string(),
        request.quality.value().to_string(),
        "-strip".to_string(),
        format!("{}:-", coder(request.format)),
    ]
}

/// Map a failed invocation's stderr to a driver error.
pub fn classify_failure(stderr: &str, format: Option<Format>) -> DriverError {
    let lower = stderr.to_ascii_lowercase();
    let message = stderr.trim().to_string();

    if lower.contains("cache resources exhausted")
        || lower.contains("exceeds limit")
        || lower.contains("memory allocation failed")
    {
        return DriverError::ResourceExhausted(message);
    }
    if lower.contains("no encode delegate") {
        if let Some(format) = format {
            return DriverError::UnsupportedFormat(format);
        }
    }
    if lower.contains("no decode delegate")
        || lower.contains("improper image header")
        || lower.contains("insufficient image data")
    {
        return DriverError::DecodeFailed(message);
    }
    DriverError::EncodeFailed(message)
}

/// Parse the output of `magick -list resource`.
///
/// ```text
/// Resource limits:
///   Width: 16KP
///   Height: 16KP
///   Area: 128MP
///   Memory: 256MiB
/// ```
pub fn parse_resource_listing(text: &str) -> ResourceListing {
    let mut listing = ResourceListing::default();
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = parse_resource_value(value);
        match key.trim().to_ascii_lowercase().as_str() {
            "width" => listing.width = value,
            "height" => listing.height = value,
            "area" => listing.area = value,
            "memory" => listing.memory = value,
            _ => {}
        }
    }
    listing
}

/// Parse one ImageMagick resource value such as `16KP`, `128MP`, `256MiB`,
/// `1.5GB` or `unlimited`.
///
/// Pixel and byte suffixes with a plain prefix are decimal (`K` = 1000);
/// the `iB` forms are binary (`Ki` = 1024).
pub fn parse_resource_value(raw: &str) -> Option<u64> {
    let s = raw.trim();
    if s.is_empty() || s.eq_ignore_ascii_case("unlimited") {
        return None;
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    let number: f64 = number.parse().ok()?;

    let suffix = suffix.trim();
    let (prefix, binary) = if let Some(p) = suffix.strip_suffix("iB") {
        (p, true)
    } else if let Some(p) = suffix.strip_suffix('P').or_else(|| suffix.strip_suffix('B')) {
        (p, false)
    } else {
        (suffix, false)
    };

    let base: f64 = if binary { 1024.0 } else { 1000.0 };
    let exponent = match prefix {
        "" => 0,
        "K" | "k" => 1,
        "M" => 2,
        "G" => 3,
        "T" => 4,
        "P" => 5,
        "E" => 6,
        _ => return None,
    };
    Some((number * base.powi(exponent)).round() as u64)
}

impl Driver for ImagickDriver {
    fn id(&self) -> DriverId {
        DriverId::Imagick
    }

    fn probe(&self) -> bool {
        match self.run(&["-version".to_string()], None) {
            Ok(output) => {
                output.status.success()
                    && String::from_utf8_lossy(&output.stdout).contains("ImageMagick")
            }
            Err(_) => false,
        }
    }

    fn decode_dimensions(&self, source: &[u8]) -> Result<Dimensions, DriverError> {
        let args = [
            "identify".to_string(),
            "-format".to_string(),
            "%w %h\n".to_string(),
            "-[0]".to_string(),
        ];
        let output = self.run(&args, Some(source))?;
        if !output.status.success() {
            return Err(classify_failure(&output.stderr, None));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let first = text.lines().next().unwrap_or_default();
        let mut parts = first.split_whitespace().map(str::parse::<u32>);
        match (parts.next(), parts.next()) {
            (Some(Ok(width)), Some(Ok(height))) => Ok(Dimensions::new(width, height)),
            _ => Err(DriverError::DecodeFailed(format!(
                "unexpected identify output: {first:?}"
            ))),
        }
    }

    fn encode(&self, source: &[u8], request: &EncodeRequest) -> Result<Vec<u8>, DriverError> {
        let output = self.run(&encode_args(request), Some(source))?;
        if !output.status.success() {
            return Err(classify_failure(&output.stderr, Some(request.format)));
        }
        Ok(output.stdout)
    }

    fn live_limit(&self, kind: LimitKind) -> Result<Option<u64>, DriverError> {
        match self.resources() {
            Ok(listing) => Ok(listing.get(kind)),
            Err(msg) => Err(DriverError::Introspection(msg.clone())),
        }
    }
}
