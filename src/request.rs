use tracing::info;

use crate::domain::{EventBatch, MetadataLevel, RequestKind, StationBatch};
use crate::error::WavereqError;
use crate::fdsnws::SubmitParams;
use crate::legacy::{LegacyOutcome, LegacySubmission};
use crate::pack::Pack;
use crate::review::TwTree;
use crate::service::{MetadataClient, SIZE_EXCEEDED_MESSAGE, TimeWindowSpec};
use crate::settings::Settings;

/// Time-window bounds as given by the user: fixed, or phase-relative to the
/// selected events.
#[derive(Debug, Clone)]
pub enum TimeWindowMode {
    Absolute {
        start: String,
        end: String,
    },
    Relative {
        start_phase: String,
        start_offset: i64,
        end_phase: String,
        end_offset: i64,
    },
}

#[derive(Debug, Clone)]
pub struct SubmitInfo {
    pub kind: RequestKind,
    pub level: Option<MetadataLevel>,
    pub mode: TimeWindowMode,
    /// Identity for the legacy request service.
    pub user: Option<String>,
    pub compressed: bool,
    pub response_dictionary: bool,
}

/// What a submission turned into, or that the user backed out.
#[derive(Debug)]
pub enum SubmitOutcome {
    Fdsnws { request_id: u64 },
    Legacy { outcome: LegacyOutcome },
    Cancelled,
}

/// Figures shown before a large request is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeSummary {
    pub lines: usize,
    /// Estimated payload, waveform requests only.
    pub size_mb: Option<u64>,
    pub parts: u64,
}

/// Decides whether a request that will be split into parts goes out.
pub trait Confirmer {
    fn confirm(&self, summary: &SizeSummary) -> bool;
}

/// Non-interactive use: accept everything.
pub struct AutoConfirm;

impl Confirmer for AutoConfirm {
    fn confirm(&self, summary: &SizeSummary) -> bool {
        if summary.parts > 1 {
            info!(
                "request of {} traces will be split into {} parts",
                summary.lines, summary.parts
            );
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Proceed,
    Discard,
}

/// Lets the caller edit the resolved time windows before anything is
/// committed.
pub trait ReviewHook {
    fn review(&self, tree: &mut TwTree) -> ReviewDecision;
}

/// Where a finished submission is handed over: the FDSNWS download side or
/// the legacy request service.
pub trait SubmitSink {
    fn submit_fdsnws(&self, params: SubmitParams) -> Result<u64, WavereqError>;
    fn submit_legacy(&self, submission: &LegacySubmission)
    -> Result<LegacyOutcome, WavereqError>;
}

/// Owns the current Pack and turns a selection into a submitted request.
pub struct RequestController {
    pack: Option<Pack>,
    next_pack_id: u64,
    settings: Settings,
}

impl RequestController {
    pub fn new(settings: Settings) -> Self {
        Self {
            pack: None,
            next_pack_id: 1,
            settings,
        }
    }

    pub fn pack(&self) -> Option<&Pack> {
        self.pack.as_ref()
    }

    pub fn pack_mut(&mut self) -> Option<&mut Pack> {
        self.pack.as_mut()
    }

    fn pack_or_new(&mut self) -> &mut Pack {
        if self.pack.is_none() {
            let id = self.next_pack_id;
            self.next_pack_id += 1;
            self.pack = Some(Pack::new(id));
        }
        self.pack.as_mut().expect("pack was just created")
    }

    /// Drop the current pack; the next append starts a fresh one.
    pub fn clear(&mut self) {
        self.pack = None;
    }

    /// Empty the station collection. A pack with neither stations nor events
    /// left is dropped, so the next append starts a fresh one.
    pub fn remove_stations(&mut self) {
        if let Some(pack) = self.pack.as_mut() {
            pack.remove_stations();
            if pack.is_empty() {
                self.pack = None;
            }
        }
    }

    /// Empty the event collection, dropping the pack once both are gone.
    pub fn remove_events(&mut self) {
        if let Some(pack) = self.pack.as_mut() {
            pack.remove_events();
            if pack.is_empty() {
                self.pack = None;
            }
        }
    }

    pub fn append_stations(&mut self, batch: &StationBatch) {
        self.pack_or_new().add_stations(batch);
    }

    pub fn append_events(&mut self, batch: &EventBatch) -> Result<(), WavereqError> {
        self.pack_or_new().add_events(batch)
    }

    /// The submission pipeline: validate the pack, resolve time windows,
    /// run the optional review, apply the size guard, then hand over to the
    /// matching sink. Nothing is persisted before the sink call.
    pub fn submit(
        &self,
        info: &SubmitInfo,
        metadata: &dyn MetadataClient,
        review: Option<&dyn ReviewHook>,
        confirmer: &dyn Confirmer,
        sink: &dyn SubmitSink,
    ) -> Result<SubmitOutcome, WavereqError> {
        let pack = self.pack.as_ref().ok_or(WavereqError::MissingPack)?;

        if !pack.has_station() {
            return Err(WavereqError::NoStationSelected);
        }
        let relative = matches!(info.mode, TimeWindowMode::Relative { .. });
        if relative && !pack.has_event() {
            return Err(WavereqError::NoEventSelected);
        }

        let streams = pack.station_lines();
        let spec = match &info.mode {
            TimeWindowMode::Absolute { start, end } => TimeWindowSpec::Absolute {
                start: start.clone(),
                end: end.clone(),
            },
            TimeWindowMode::Relative {
                start_phase,
                start_offset,
                end_phase,
                end_offset,
            } => TimeWindowSpec::Relative {
                events: pack.event_lines()?,
                start_phase: start_phase.clone(),
                start_offset: *start_offset,
                end_phase: end_phase.clone(),
                end_offset: *end_offset,
            },
        };

        let mut timewindows = match metadata.timewindows(&streams, &spec) {
            Ok(timewindows) => timewindows,
            Err(WavereqError::MetadataStatus { status: 500, message })
                if message.trim() == SIZE_EXCEEDED_MESSAGE =>
            {
                return Err(WavereqError::TraceLimitExceeded {
                    limit: self.settings.total_line_limit,
                });
            }
            Err(err) => return Err(err),
        };
        if timewindows.is_empty() {
            return Err(WavereqError::NoDataAvailable);
        }

        if let Some(hook) = review {
            let mut tree = TwTree::steepen(&timewindows);
            if hook.review(&mut tree) == ReviewDecision::Discard {
                return Ok(SubmitOutcome::Cancelled);
            }
            timewindows = tree.flatten();
            if timewindows.is_empty() {
                return Err(WavereqError::NoDataAvailable);
            }
        }

        let summary = self.size_summary(info.kind, &timewindows)?;
        if !confirmer.confirm(&summary) {
            return Ok(SubmitOutcome::Cancelled);
        }

        let description = format!("Package {}", pack.id());

        if let Some(presets) = info.kind.presets(&description, info.level) {
            let params = SubmitParams {
                service: presets.service.to_string(),
                options: presets.options,
                bulk: presets.bulk,
                merge: presets.merge,
                content_type: presets.content_type.to_string(),
                filename: presets.filename,
                timewindows,
            };
            let request_id = sink.submit_fdsnws(params)?;
            return Ok(SubmitOutcome::Fdsnws { request_id });
        }

        let submission = LegacySubmission {
            user: info.user.clone().unwrap_or_default(),
            kind: info.kind,
            compressed: info.compressed,
            response_dictionary: info.response_dictionary,
            timewindows,
            event_info: if pack.has_event() {
                pack.event_lines()?
            } else {
                Vec::new()
            },
        };
        let outcome = sink.submit_legacy(&submission)?;
        Ok(SubmitOutcome::Legacy { outcome })
    }

    /// The size guard. Waveform requests check both trace count and the
    /// estimated payload against the hard total limits; metadata requests
    /// only the trace count. The part count is informational, splitting
    /// happens downstream.
    fn size_summary(
        &self,
        kind: RequestKind,
        timewindows: &[crate::domain::LineItem],
    ) -> Result<SizeSummary, WavereqError> {
        let s = &self.settings;
        let lines = timewindows.len();

        if kind.is_waveform() {
            const MIB: u64 = 1024 * 1024;
            let total_bytes: u64 = timewindows.iter().filter_map(|tw| tw.size).sum();
            let size_mb = total_bytes.div_ceil(MIB);

            if lines as u64 > s.total_line_limit || size_mb > s.total_size_limit {
                return Err(WavereqError::TotalLimitExceeded {
                    lines,
                    size_mb,
                    line_limit: s.total_line_limit,
                    size_limit: s.total_size_limit,
                });
            }

            let parts = u64::max(
                (lines as u64).div_ceil(s.line_limit),
                size_mb.div_ceil(s.size_limit),
            );
            return Ok(SizeSummary {
                lines,
                size_mb: Some(size_mb),
                parts,
            });
        }

        if lines as u64 > s.total_line_limit {
            return Err(WavereqError::TraceLimitExceeded {
                limit: s.total_line_limit,
            });
        }
        Ok(SizeSummary {
            lines,
            size_mb: None,
            parts: (lines as u64).div_ceil(s.local_line_limit),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::LineItem;
    use assert_matches::assert_matches;

    fn item(size: u64) -> LineItem {
        LineItem {
            start: "2020-01-01T00:00:00Z".to_string(),
            end: "2020-01-02T00:00:00Z".to_string(),
            network: "GE".to_string(),
            station: "APE".to_string(),
            channel: "BHZ".to_string(),
            location: "".to_string(),
            size: Some(size),
        }
    }

    #[test]
    fn waveform_summary_rounds_up() {
        let controller = RequestController::new(Settings::default());
        let windows = vec![item(1024 * 1024 + 1), item(512)];
        let summary = controller
            .size_summary(RequestKind::Dataselect, &windows)
            .unwrap();
        assert_eq!(summary.lines, 2);
        assert_eq!(summary.size_mb, Some(2));
        assert_eq!(summary.parts, 1);
    }

    #[test]
    fn waveform_hard_limit_blocks() {
        let mut settings = Settings::default();
        settings.total_size_limit = 1;
        let controller = RequestController::new(settings);
        let windows = vec![item(3 * 1024 * 1024)];
        assert_matches!(
            controller.size_summary(RequestKind::Dataselect, &windows),
            Err(WavereqError::TotalLimitExceeded { size_mb: 3, .. })
        );
    }

    #[test]
    fn metadata_summary_uses_local_line_limit() {
        let mut settings = Settings::default();
        settings.local_line_limit = 10;
        let controller = RequestController::new(settings);
        let windows: Vec<_> = (0..25).map(|_| item(0)).collect();
        let summary = controller
            .size_summary(RequestKind::StationXml, &windows)
            .unwrap();
        assert_eq!(summary.size_mb, None);
        assert_eq!(summary.parts, 3);
    }

    #[test]
    fn metadata_hard_limit_blocks() {
        let mut settings = Settings::default();
        settings.total_line_limit = 2;
        let controller = RequestController::new(settings);
        let windows: Vec<_> = (0..3).map(|_| item(0)).collect();
        assert_matches!(
            controller.size_summary(RequestKind::StationText, &windows),
            Err(WavereqError::TraceLimitExceeded { limit: 2 })
        );
    }
}
