// Streaming firmware update against a conditional-fetch endpoint
//
// GET <url> with `Hash: <running identity>`. 200 streams a new image into the
// inactive slot, anything else means the running image is current.

use thiserror::Error;

use crate::bootstrap::System;
use crate::error::{DriverError, RestartReason};
use crate::identity::FirmwareIdentity;

pub const HASH_HEADER: &str = "Hash";
pub const HTTP_OK: u16 = 200;

/// Bytes moved per read/write. The only buffer the transfer uses.
pub const CHUNK_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("update endpoint i/o failed: {0}")]
    Transport(#[source] DriverError),
    #[error("firmware slot operation failed: {0}")]
    Flash(#[source] DriverError),
    #[error("server offered an empty image")]
    EmptyImage,
    #[error("image of {declared} bytes does not fit slot of {capacity} bytes")]
    ImageTooLarge { declared: u64, capacity: u64 },
    #[error("image stream exceeded slot capacity of {capacity} bytes")]
    Overrun { capacity: u64 },
    #[error("image body ended after {received} of {expected} bytes")]
    ShortBody { expected: u64, received: u64 },
    #[error("refusing to write to running slot '{label}'")]
    ActiveSlot { label: String },
}

/// HTTP(S) client side of the update protocol.
pub trait UpdateTransport {
    type Response: UpdateResponse;

    /// Send the request and read the response head only. The body stays
    /// unread until the caller streams it; dropping the response discards it.
    fn open(&mut self, url: &str, headers: &[(&str, &str)]) -> Result<Self::Response, DriverError>;
}

pub trait UpdateResponse {
    fn status(&self) -> u16;
    fn content_length(&self) -> Option<u64>;
    /// Read up to `buf.len()` body bytes. `Ok(0)` is end of body.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DriverError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub label: String,
    pub capacity: u64,
    pub running: bool,
}

/// A/B firmware partitions.
pub trait FirmwareSlots {
    type Writer<'a>: SlotWriter
    where
        Self: 'a;

    fn running_slot(&self) -> Result<SlotInfo, DriverError>;

    /// The slot that is not currently executing.
    fn next_update_slot(&self) -> Result<SlotInfo, DriverError>;

    /// Erase and open `slot` for an image of `image_len` bytes (unknown if `None`).
    fn begin(
        &mut self,
        slot: &SlotInfo,
        image_len: Option<u64>,
    ) -> Result<Self::Writer<'_>, DriverError>;
}

pub trait SlotWriter {
    fn write(&mut self, data: &[u8]) -> Result<(), DriverError>;
    /// Finish the write and make the slot the next boot target.
    fn commit(self) -> Result<(), DriverError>;
    /// Release the write handle without touching the boot target.
    fn abort(self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateCheck {
    UpToDate { status: u16 },
    Applied { bytes: u64, slot: String },
}

/// Bounded-chunk view over a response body.
///
/// Never reads past the declared length and cannot be resumed; a failed
/// transfer starts over on the next boot.
pub struct BodyChunks<'r, R, const N: usize = CHUNK_SIZE> {
    response: &'r mut R,
    buf: [u8; N],
    remaining: Option<u64>,
    received: u64,
    done: bool,
}

impl<'r, R: UpdateResponse, const N: usize> BodyChunks<'r, R, N> {
    pub fn new(response: &'r mut R, declared: Option<u64>) -> Self {
        Self {
            response,
            buf: [0; N],
            remaining: declared,
            received: 0,
            done: false,
        }
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn next_chunk(&mut self) -> Option<Result<&[u8], UpdateError>> {
        if self.done {
            return None;
        }
        let want = match self.remaining {
            Some(0) => {
                self.done = true;
                return None;
            }
            Some(left) => left.min(N as u64) as usize,
            None => N,
        };

        match self.response.read(&mut self.buf[..want]) {
            Err(e) => {
                self.done = true;
                Some(Err(UpdateError::Transport(e)))
            }
            Ok(0) => {
                self.done = true;
                self.remaining.map(|left| {
                    Err(UpdateError::ShortBody {
                        expected: self.received + left,
                        received: self.received,
                    })
                })
            }
            Ok(n) => {
                let n = n.min(want);
                self.received += n as u64;
                if let Some(left) = self.remaining.as_mut() {
                    *left -= n as u64;
                }
                Some(Ok(&self.buf[..n]))
            }
        }
    }
}

/// One update attempt: the open response, the slot write handle and the
/// running byte count. Dropping an uncommitted session aborts the write.
pub struct UpdateSession<R: UpdateResponse, W: SlotWriter> {
    response: R,
    writer: Option<W>,
    slot: SlotInfo,
    declared: Option<u64>,
    written: u64,
}

impl<R: UpdateResponse, W: SlotWriter> UpdateSession<R, W> {
    pub fn new(response: R, writer: W, slot: SlotInfo, declared: Option<u64>) -> Self {
        Self {
            response,
            writer: Some(writer),
            slot,
            declared,
            written: 0,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Copy the body into the slot, one chunk at a time.
    pub fn stream<const N: usize>(&mut self) -> Result<u64, UpdateError> {
        let Self {
            response,
            writer,
            slot,
            declared,
            written,
        } = self;
        let writer = writer.as_mut().ok_or_else(|| session_closed("ota write"))?;

        let mut chunks = BodyChunks::<R, N>::new(response, *declared);
        let mut next_report = 0u64;
        while let Some(chunk) = chunks.next_chunk() {
            let chunk = chunk?;
            if *written + chunk.len() as u64 > slot.capacity {
                return Err(UpdateError::Overrun {
                    capacity: slot.capacity,
                });
            }
            writer.write(chunk).map_err(UpdateError::Flash)?;
            *written += chunk.len() as u64;

            if *written >= next_report {
                match declared {
                    Some(total) => log::info!(
                        "OTA progress: {}% ({}/{})",
                        *written * 100 / *total,
                        written,
                        total
                    ),
                    None => log::info!("OTA progress: {} bytes", written),
                }
                next_report = *written + 64 * 1024;
            }
        }
        Ok(*written)
    }

    /// Finalize the write and switch the boot target.
    pub fn commit(mut self) -> Result<u64, UpdateError> {
        if self.written == 0 {
            return Err(UpdateError::EmptyImage);
        }
        if let Some(expected) = self.declared {
            if self.written != expected {
                return Err(UpdateError::ShortBody {
                    expected,
                    received: self.written,
                });
            }
        }
        let writer = self.writer.take().ok_or_else(|| session_closed("ota end"))?;
        writer.commit().map_err(UpdateError::Flash)?;
        log::info!(
            "Wrote {} bytes to '{}', set as boot partition",
            self.written,
            self.slot.label
        );
        Ok(self.written)
    }
}

fn session_closed(operation: &'static str) -> UpdateError {
    UpdateError::Flash(DriverError::new(operation, "session already closed"))
}

impl<R: UpdateResponse, W: SlotWriter> Drop for UpdateSession<R, W> {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            log::warn!(
                "Discarding update session: {} bytes written to '{}'",
                self.written,
                self.slot.label
            );
            writer.abort();
        }
    }
}

pub struct FirmwareUpdater<T, F, const N: usize = CHUNK_SIZE> {
    transport: T,
    slots: F,
}

impl<T: UpdateTransport, F: FirmwareSlots, const N: usize> FirmwareUpdater<T, F, N> {
    pub fn new(transport: T, slots: F) -> Self {
        Self { transport, slots }
    }

    pub fn slots(&self) -> &F {
        &self.slots
    }

    /// Ask the endpoint whether `identity` is current and, if not, stage the
    /// offered image into the inactive slot and make it the boot target.
    pub fn check(
        &mut self,
        url: &str,
        identity: &FirmwareIdentity,
    ) -> Result<UpdateCheck, UpdateError> {
        log::info!("Checking {} for firmware newer than {}", url, identity);
        let hash = identity.to_hex();
        let response = self
            .transport
            .open(url, &[(HASH_HEADER, hash.as_str())])
            .map_err(UpdateError::Transport)?;

        let status = response.status();
        if status != HTTP_OK {
            log::info!("No firmware update (HTTP {})", status);
            return Ok(UpdateCheck::UpToDate { status });
        }

        let declared = response.content_length();
        if declared == Some(0) {
            return Err(UpdateError::EmptyImage);
        }

        let slot = self.slots.next_update_slot().map_err(UpdateError::Flash)?;
        if slot.running {
            return Err(UpdateError::ActiveSlot { label: slot.label });
        }
        if let Some(len) = declared {
            if len > slot.capacity {
                return Err(UpdateError::ImageTooLarge {
                    declared: len,
                    capacity: slot.capacity,
                });
            }
        }

        log::info!(
            "Firmware update available: {} bytes -> '{}'",
            declared.map(|l| l.to_string()).unwrap_or_else(|| "unknown".to_string()),
            slot.label
        );
        let writer = self.slots.begin(&slot, declared).map_err(UpdateError::Flash)?;
        let label = slot.label.clone();
        let mut session = UpdateSession::new(response, writer, slot, declared);
        session.stream::<N>()?;
        let bytes = session.commit()?;

        Ok(UpdateCheck::Applied { bytes, slot: label })
    }

    /// Returns if the running image is current. Restarts the device after an
    /// applied update and on any failure.
    pub fn check_and_apply<Y: System + ?Sized>(
        &mut self,
        url: &str,
        identity: &FirmwareIdentity,
        system: &Y,
    ) {
        match self.check(url, identity) {
            Ok(UpdateCheck::UpToDate { .. }) => {}
            Ok(UpdateCheck::Applied { bytes, slot }) => {
                log::info!("Firmware update complete, restarting");
                system.restart(RestartReason::UpdateApplied { bytes, slot })
            }
            Err(e) => {
                log::error!("Firmware update failed: {}", e);
                system.restart(RestartReason::UpdateFailed(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    struct Scripted {
        status: u16,
        declared: Option<u64>,
        body: Vec<u8>,
        pos: usize,
        max_read: usize,
        fail_at: Option<usize>,
    }

    impl Scripted {
        fn ok(body: Vec<u8>) -> Self {
            Self {
                status: 200,
                declared: Some(body.len() as u64),
                body,
                pos: 0,
                max_read: usize::MAX,
                fail_at: None,
            }
        }
    }

    impl UpdateResponse for Scripted {
        fn status(&self) -> u16 {
            self.status
        }

        fn content_length(&self) -> Option<u64> {
            self.declared
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize, DriverError> {
            if self.fail_at.map_or(false, |at| self.pos >= at) {
                return Err(DriverError::new("esp_http_client_read", "connection reset"));
            }
            let n = buf.len().min(self.max_read).min(self.body.len() - self.pos);
            buf[..n].copy_from_slice(&self.body[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    struct OneShot {
        response: Option<Scripted>,
        headers: Vec<(String, String)>,
    }

    impl UpdateTransport for OneShot {
        type Response = Scripted;

        fn open(&mut self, _url: &str, headers: &[(&str, &str)]) -> Result<Scripted, DriverError> {
            self.headers = headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
            self.response
                .take()
                .ok_or_else(|| DriverError::new("esp_http_client_open", "refused"))
        }
    }

    #[derive(Default)]
    struct MemSlots {
        capacity: u64,
        next_is_running: bool,
        image: Vec<u8>,
        begun_with: Option<Option<u64>>,
        writes: usize,
        boot_target: Option<String>,
        aborted: bool,
        fail_commit: bool,
    }

    struct MemWriter<'a> {
        slots: &'a mut MemSlots,
    }

    impl FirmwareSlots for MemSlots {
        type Writer<'a> = MemWriter<'a>;

        fn running_slot(&self) -> Result<SlotInfo, DriverError> {
            Ok(SlotInfo {
                label: "ota_0".into(),
                capacity: self.capacity,
                running: true,
            })
        }

        fn next_update_slot(&self) -> Result<SlotInfo, DriverError> {
            Ok(SlotInfo {
                label: if self.next_is_running { "ota_0" } else { "ota_1" }.into(),
                capacity: self.capacity,
                running: self.next_is_running,
            })
        }

        fn begin(&mut self, _slot: &SlotInfo, image_len: Option<u64>) -> Result<MemWriter<'_>, DriverError> {
            self.begun_with = Some(image_len);
            self.image.clear();
            Ok(MemWriter { slots: self })
        }
    }

    impl SlotWriter for MemWriter<'_> {
        fn write(&mut self, data: &[u8]) -> Result<(), DriverError> {
            self.slots.writes += 1;
            self.slots.image.extend_from_slice(data);
            Ok(())
        }

        fn commit(self) -> Result<(), DriverError> {
            if self.slots.fail_commit {
                return Err(DriverError::new("esp_ota_end", "image invalid"));
            }
            self.slots.boot_target = Some("ota_1".into());
            Ok(())
        }

        fn abort(self) {
            self.slots.aborted = true;
        }
    }

    fn updater(response: Scripted, capacity: u64) -> FirmwareUpdater<OneShot, MemSlots, 16> {
        FirmwareUpdater::new(
            OneShot {
                response: Some(response),
                headers: Vec::new(),
            },
            MemSlots {
                capacity,
                ..Default::default()
            },
        )
    }

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    fn identity() -> FirmwareIdentity {
        FirmwareIdentity::of_image(b"running")
    }

    #[test]
    fn not_modified_writes_nothing() {
        let mut response = Scripted::ok(body(100));
        response.status = 304;
        let mut up = updater(response, 4096);

        let outcome = up.check("http://u/fw", &identity()).unwrap();
        assert_eq!(outcome, UpdateCheck::UpToDate { status: 304 });
        assert_eq!(up.slots.begun_with, None);
        assert_eq!(up.slots.writes, 0);
        assert_eq!(up.slots.boot_target, None);
    }

    #[test]
    fn sends_identity_as_hash_header() {
        let mut response = Scripted::ok(Vec::new());
        response.status = 304;
        let mut up = updater(response, 4096);
        up.check("http://u/fw", &identity()).unwrap();
        assert_eq!(
            up.transport.headers,
            vec![("Hash".to_string(), identity().to_hex())]
        );
    }

    #[test]
    fn ok_streams_whole_image_and_switches_boot_target() {
        // 100 is not a multiple of the 16 byte chunk
        let image = body(100);
        let mut up = updater(Scripted::ok(image.clone()), 4096);

        let outcome = up.check("http://u/fw", &identity()).unwrap();
        assert_eq!(
            outcome,
            UpdateCheck::Applied {
                bytes: 100,
                slot: "ota_1".into()
            }
        );
        assert_eq!(up.slots.image, image);
        assert_eq!(up.slots.writes, 7);
        assert_eq!(up.slots.begun_with, Some(Some(100)));
        assert_eq!(up.slots.boot_target.as_deref(), Some("ota_1"));
        assert!(!up.slots.aborted);
    }

    #[test]
    fn body_beyond_declared_length_is_not_read() {
        let mut response = Scripted::ok(body(64));
        response.declared = Some(40);
        let mut up = updater(response, 4096);
        up.check("http://u/fw", &identity()).unwrap();
        assert_eq!(up.slots.image.len(), 40);
    }

    #[test]
    fn short_body_aborts_without_boot_switch() {
        let mut response = Scripted::ok(body(50));
        response.declared = Some(80);
        let mut up = updater(response, 4096);

        let err = up.check("http://u/fw", &identity()).unwrap_err();
        assert!(matches!(err, UpdateError::ShortBody { expected: 80, received: 50 }));
        assert!(up.slots.aborted);
        assert_eq!(up.slots.boot_target, None);
    }

    #[test]
    fn read_error_mid_stream_aborts() {
        let mut response = Scripted::ok(body(200));
        response.fail_at = Some(48);
        let mut up = updater(response, 4096);

        let err = up.check("http://u/fw", &identity()).unwrap_err();
        assert!(matches!(err, UpdateError::Transport(_)));
        assert_eq!(up.slots.image.len(), 48);
        assert!(up.slots.aborted);
        assert_eq!(up.slots.boot_target, None);
    }

    #[test]
    fn oversized_image_is_refused_before_erasing() {
        let mut up = updater(Scripted::ok(body(100)), 64);
        let err = up.check("http://u/fw", &identity()).unwrap_err();
        assert!(matches!(err, UpdateError::ImageTooLarge { declared: 100, capacity: 64 }));
        assert_eq!(up.slots.begun_with, None);
    }

    #[test]
    fn undeclared_length_is_bounded_by_slot() {
        let mut response = Scripted::ok(body(100));
        response.declared = None;
        let mut up = updater(response, 64);

        let err = up.check("http://u/fw", &identity()).unwrap_err();
        assert!(matches!(err, UpdateError::Overrun { capacity: 64 }));
        assert_eq!(up.slots.begun_with, Some(None));
        assert!(up.slots.image.len() <= 64);
        assert!(up.slots.aborted);
    }

    #[test]
    fn undeclared_length_streams_to_end_of_body() {
        let mut response = Scripted::ok(body(70));
        response.declared = None;
        let mut up = updater(response, 4096);
        let outcome = up.check("http://u/fw", &identity()).unwrap();
        assert_eq!(outcome, UpdateCheck::Applied { bytes: 70, slot: "ota_1".into() });
    }

    #[test]
    fn empty_image_is_an_error() {
        let mut up = updater(Scripted::ok(Vec::new()), 4096);
        assert!(matches!(
            up.check("http://u/fw", &identity()),
            Err(UpdateError::EmptyImage)
        ));
        assert_eq!(up.slots.begun_with, None);

        let mut response = Scripted::ok(Vec::new());
        response.declared = None;
        let mut up = updater(response, 4096);
        assert!(matches!(
            up.check("http://u/fw", &identity()),
            Err(UpdateError::EmptyImage)
        ));
        assert!(up.slots.aborted);
    }

    #[test]
    fn never_writes_to_running_slot() {
        let mut up = updater(Scripted::ok(body(10)), 4096);
        up.slots.next_is_running = true;
        let err = up.check("http://u/fw", &identity()).unwrap_err();
        assert!(matches!(err, UpdateError::ActiveSlot { .. }));
        assert_eq!(up.slots.writes, 0);
    }

    #[test]
    fn failed_finalize_leaves_boot_target() {
        let mut up = updater(Scripted::ok(body(33)), 4096);
        up.slots.fail_commit = true;
        let err = up.check("http://u/fw", &identity()).unwrap_err();
        assert!(matches!(err, UpdateError::Flash(_)));
        assert_eq!(up.slots.boot_target, None);
    }

    #[test]
    fn connection_failure_is_transport_error() {
        let mut up: FirmwareUpdater<OneShot, MemSlots, 16> = FirmwareUpdater::new(
            OneShot {
                response: None,
                headers: Vec::new(),
            },
            MemSlots::default(),
        );
        assert!(matches!(
            up.check("http://u/fw", &identity()),
            Err(UpdateError::Transport(_))
        ));
    }

    #[test]
    fn chunks_stop_at_declared_length() {
        let mut response = Scripted::ok(body(40));
        let mut chunks = BodyChunks::<_, 16>::new(&mut response, Some(40));
        let mut sizes = Vec::new();
        while let Some(chunk) = chunks.next_chunk() {
            sizes.push(chunk.unwrap().len());
        }
        assert_eq!(sizes, vec![16, 16, 8]);
        assert_eq!(chunks.received(), 40);
        assert!(chunks.next_chunk().is_none());
    }

    proptest! {
        #[test]
        fn any_length_and_fragmentation_is_written_exactly(
            len in 1usize..3000,
            max_read in 1usize..40,
        ) {
            let image = body(len);
            let mut response = Scripted::ok(image.clone());
            response.max_read = max_read;
            let mut up = updater(response, 4096);

            let outcome = up.check("http://u/fw", &identity()).unwrap();
            prop_assert_eq!(outcome, UpdateCheck::Applied { bytes: len as u64, slot: "ota_1".into() });
            prop_assert_eq!(&up.slots.image, &image);
            prop_assert_eq!(up.slots.boot_target.as_deref(), Some("ota_1"));
        }
    }
}
