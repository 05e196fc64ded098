//! Persistence of turn audio: local WAV output, or transcode and upload to S3.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::PersistenceError;
use crate::Config;

/// Sample rate requested from the engine for every audio format.
pub const SAMPLE_RATE_HERTZ: u32 = 16000;

/// Stores turn audio somewhere the caller can reference.
#[async_trait]
pub trait AudioPersistence: Send + Sync {
    /// Persist `audio` and return where it ended up (URL or path).
    async fn persist(&self, audio: &[u8]) -> Result<String, PersistenceError>;
}

/// Wrapper around the external transcoder binary.
#[derive(Debug, Clone)]
pub struct Transcoder {
    binary: PathBuf,
    timeout: Duration,
}

impl Transcoder {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: Duration::from_secs(3),
        }
    }

    /// Mono, 48 kbps MP3 at 16 kHz with doubled gain.
    pub fn args(input: &Path, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-y".into(), "-i".into(), input.into()];
        args.extend(
            [
                "-ac", "1", "-codec:a", "libmp3lame", "-b:a", "48k", "-ar", "16000", "-af",
                "volume=2.0",
            ]
            .into_iter()
            .map(OsString::from),
        );
        args.push(output.into());
        args
    }

    pub async fn transcode(&self, input: &Path, output: &Path) -> Result<(), PersistenceError> {
        let mut command = tokio::process::Command::new(&self.binary);
        command
            .args(Self::args(input, output))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let result = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                PersistenceError::Transcode(format!("timed out after {:?}", self.timeout))
            })?
            .map_err(|e| {
                PersistenceError::Transcode(format!(
                    "failed to run {}: {}",
                    self.binary.display(),
                    e
                ))
            })?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            warn!(status = %result.status, stderr = %stderr, "Transcoder failed");
            return Err(PersistenceError::Transcode(format!(
                "{} exited with {}",
                self.binary.display(),
                result.status
            )));
        }

        debug!(output = %output.display(), "Transcoded audio");
        Ok(())
    }
}

/// Transcodes MP3 audio and uploads it to a public S3 bucket.
pub struct S3AudioPublisher {
    client: S3Client,
    bucket: String,
    region: String,
    scratch_dir: PathBuf,
    transcoder: Transcoder,
}

impl S3AudioPublisher {
    pub fn new(client: S3Client, config: &Config) -> Self {
        Self {
            client,
            bucket: config.s3_bucket.clone(),
            region: config.s3_region.clone(),
            scratch_dir: config.scratch_dir.clone(),
            transcoder: Transcoder::new(&config.ffmpeg_path),
        }
    }

    /// Build a client pinned to the configured bucket region.
    pub fn from_sdk_config(sdk_config: &aws_config::SdkConfig, config: &Config) -> Self {
        let s3_config = aws_sdk_s3::config::Builder::from(sdk_config)
            .region(aws_sdk_s3::config::Region::new(config.s3_region.clone()))
            .build();
        Self::new(S3Client::from_conf(s3_config), config)
    }

    pub fn public_url(&self, key: &str) -> String {
        format!(
            "https://s3-{}.amazonaws.com/{}/{}",
            self.region, self.bucket, key
        )
    }

    async fn upload(&self, path: &Path, key: &str) -> Result<(), PersistenceError> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| PersistenceError::Upload(format!("failed to read {}: {}", path.display(), e)))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("audio/mpeg")
            .body(body)
            .send()
            .await
            .map_err(|e| PersistenceError::Upload(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl AudioPersistence for S3AudioPublisher {
    async fn persist(&self, audio: &[u8]) -> Result<String, PersistenceError> {
        let raw = self.scratch_dir.join("temp.mp3");
        let converted = self.scratch_dir.join("temp2.mp3");
        remove_stale(&raw).await?;
        remove_stale(&converted).await?;

        tokio::fs::write(&raw, audio).await?;
        self.transcoder.transcode(&raw, &converted).await?;

        let key = format!("{}.mp3", Uuid::new_v4());
        self.upload(&converted, &key).await?;

        let url = self.public_url(&key);
        info!(bytes = audio.len(), url = %url, "Uploaded turn audio");
        Ok(url)
    }
}

async fn remove_stale(path: &Path) -> Result<(), PersistenceError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Writes LINEAR16 audio to a local WAV file.
#[derive(Debug, Clone)]
pub struct WavFileWriter {
    path: PathBuf,
}

impl WavFileWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AudioPersistence for WavFileWriter {
    async fn persist(&self, audio: &[u8]) -> Result<String, PersistenceError> {
        let path = self.path.clone();
        let pcm = audio.to_vec();

        tokio::task::spawn_blocking(move || write_wav(&path, &pcm))
            .await
            .map_err(|e| PersistenceError::Io(std::io::Error::other(e)))??;

        info!(bytes = audio.len(), path = %self.path.display(), "Wrote turn audio");
        Ok(self.path.display().to_string())
    }
}

/// Write 16-bit little-endian mono PCM at 16 kHz as a WAV file.
pub fn write_wav(path: &Path, pcm: &[u8]) -> Result<(), PersistenceError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE_HERTZ,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let samples = pcm.chunks_exact(2);
    let remainder = samples.remainder().len();
    if remainder > 0 {
        warn!(
            bytes = pcm.len(),
            dropped = remainder,
            "LINEAR16 audio has a partial trailing sample"
        );
    }

    let mut writer = hound::WavWriter::create(path, spec)?;
    for sample in samples {
        writer.write_sample(i16::from_le_bytes([sample[0], sample[1]]))?;
    }
    writer.finalize()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcoder_args() {
        let args = Transcoder::args(Path::new("/tmp/in.mp3"), Path::new("/tmp/out.mp3"));
        let args: Vec<String> = args
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(args.first().map(String::as_str), Some("-y"));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/out.mp3"));
        let joined = args.join(" ");
        assert!(joined.contains("-i /tmp/in.mp3"));
        assert!(joined.contains("-ac 1"));
        assert!(joined.contains("-b:a 48k"));
        assert!(joined.contains("-ar 16000"));
        assert!(joined.contains("-af volume=2.0"));
    }

    #[tokio::test]
    async fn test_transcoder_exit_status() {
        let input = Path::new("/tmp/in.mp3");
        let output = Path::new("/tmp/out.mp3");

        assert!(Transcoder::new("true").transcode(input, output).await.is_ok());
        assert!(matches!(
            Transcoder::new("false").transcode(input, output).await,
            Err(PersistenceError::Transcode(_))
        ));
        assert!(matches!(
            Transcoder::new("/nonexistent/ffmpeg").transcode(input, output).await,
            Err(PersistenceError::Transcode(_))
        ));
    }

    #[test]
    fn test_public_url() {
        let config = Config::from_lookup(|key| match key {
            "AWS_S3_BUCKET" => Some("voice-replies".to_string()),
            "AWS_S3_REGION" => Some("us-west-2".to_string()),
            _ => None,
        })
        .unwrap();
        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new("us-west-2"))
            .build();

        let publisher = S3AudioPublisher::new(S3Client::from_conf(s3_config), &config);
        assert_eq!(
            publisher.public_url("abc.mp3"),
            "https://s3-us-west-2.amazonaws.com/voice-replies/abc.mp3"
        );
    }

    #[tokio::test]
    async fn test_wav_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.wav");
        let pcm: Vec<u8> = [1i16, -2, 300]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();

        let written = WavFileWriter::new(&path).persist(&pcm).await.unwrap();
        assert_eq!(written, path.display().to_string());

        let mut reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 16000);
        assert_eq!(spec.bits_per_sample, 16);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![1, -2, 300]);
    }

    #[test]
    fn test_wav_drops_partial_trailing_sample() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odd.wav");
        let mut pcm: Vec<u8> = [7i16, -7].iter().flat_map(|s| s.to_le_bytes()).collect();
        pcm.push(0x7f);

        write_wav(&path, &pcm).unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.len(), 2);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![7, -7]);
    }
}
