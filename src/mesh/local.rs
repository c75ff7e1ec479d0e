use crate::media::{LocalTrack, MediaStream, TrackKind};

struct ScreenShare {
    stream: MediaStream,
    /// Tracks the capture brought; the carried-over microphone is not among them
    owned: Vec<LocalTrack>,
}

/// Local media held by the coordinator: the camera stream for the whole
/// session and, while sharing, the screen stream that replaces it as the
/// outbound stream. The camera stream is kept aside untouched during a share,
/// so stopping it restores the very same stream.
pub struct LocalMedia {
    camera: MediaStream,
    screen: Option<ScreenShare>,
}

impl LocalMedia {
    pub fn new(camera: MediaStream) -> Self {
        Self {
            camera,
            screen: None,
        }
    }

    pub fn camera(&self) -> &MediaStream {
        &self.camera
    }

    /// The stream sent to peers right now
    pub fn current(&self) -> &MediaStream {
        match &self.screen {
            Some(share) => &share.stream,
            None => &self.camera,
        }
    }

    pub fn is_sharing(&self) -> bool {
        self.screen.is_some()
    }

    pub fn audio_enabled(&self) -> bool {
        self.camera.audio_track().is_some_and(|t| t.is_enabled())
    }

    pub fn video_enabled(&self) -> bool {
        self.camera.video_track().is_some_and(|t| t.is_enabled())
    }

    /// Flips every camera-stream audio track; returns the new state
    pub fn toggle_audio(&self) -> bool {
        let enabled = !self.audio_enabled();
        for track in self.camera.tracks() {
            if track.kind() == TrackKind::Audio {
                track.set_enabled(enabled);
            }
        }
        enabled
    }

    pub fn toggle_video(&self) -> bool {
        let enabled = !self.video_enabled();
        for track in self.camera.tracks() {
            if track.kind() == TrackKind::Video {
                track.set_enabled(enabled);
            }
        }
        enabled
    }

    /// Makes `display` the outbound stream. Returns the screen video track
    /// every call must switch to, or `None` (and nothing changes) when the
    /// capture has no video or a share is already running.
    pub fn start_share(&mut self, display: MediaStream, carry_audio: bool) -> Option<LocalTrack> {
        if self.screen.is_some() {
            return None;
        }
        let video = display.video_track()?;
        let owned = display.tracks();
        if carry_audio && display.audio_track().is_none() {
            if let Some(mic) = self.camera.audio_track() {
                display.add_track(mic);
            }
        }
        self.screen = Some(ScreenShare {
            stream: display,
            owned,
        });
        Some(video)
    }

    /// Stops the capture and goes back to the camera stream. Returns the
    /// camera video track to switch calls back to.
    pub fn stop_share(&mut self) -> Option<LocalTrack> {
        let share = self.screen.take()?;
        for track in &share.owned {
            track.stop();
        }
        self.camera.video_track()
    }

    /// Id of the screen video track while sharing
    pub fn screen_video_id(&self) -> Option<String> {
        self.screen
            .as_ref()
            .and_then(|s| s.stream.video_track())
            .map(|t| t.id().to_string())
    }

    pub fn stop_all(&mut self) {
        if let Some(share) = self.screen.take() {
            share.stream.stop_all();
        }
        self.camera.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera() -> MediaStream {
        MediaStream::new(vec![
            LocalTrack::new(TrackKind::Video, "camera", "c"),
            LocalTrack::new(TrackKind::Audio, "microphone", "c"),
        ])
    }

    fn display() -> MediaStream {
        MediaStream::new(vec![LocalTrack::new(TrackKind::Video, "screen", "d")])
    }

    #[test]
    fn toggles_are_reversible() {
        let local = LocalMedia::new(camera());
        assert!(!local.toggle_audio());
        assert!(!local.audio_enabled());
        assert!(local.toggle_audio());
        assert!(!local.toggle_video());
        assert!(local.toggle_video());
        assert!(local.video_enabled());
    }

    #[test]
    fn share_round_trip_restores_camera_identity() {
        let cam = camera();
        let mut local = LocalMedia::new(cam.clone());
        let screen = display();
        let screen_video = screen.video_track().expect("video");

        let pushed = local.start_share(screen.clone(), true).expect("share");
        assert!(pushed.ptr_eq(&screen_video));
        assert!(local.current().ptr_eq(&screen));
        let mic = cam.audio_track().expect("mic");
        assert!(local.current().contains(&mic));
        assert!(local.start_share(display(), true).is_none());

        let back = local.stop_share().expect("camera video");
        assert!(back.ptr_eq(&cam.video_track().expect("cam video")));
        assert!(local.current().ptr_eq(&cam));
        assert!(screen_video.is_ended());
        assert!(!mic.is_ended());
        assert!(local.stop_share().is_none());
    }

    #[test]
    fn audio_toggle_reaches_the_carried_microphone() {
        let cam = camera();
        let mut local = LocalMedia::new(cam.clone());
        let screen = display();
        local.start_share(screen.clone(), true);
        local.toggle_audio();
        assert!(!screen.audio_track().expect("carried").is_enabled());
    }

    #[test]
    fn stop_all_ends_everything() {
        let cam = camera();
        let mut local = LocalMedia::new(cam.clone());
        let screen = display();
        local.start_share(screen.clone(), false);
        local.stop_all();
        assert!(cam.tracks().iter().all(|t| t.is_ended()));
        assert!(screen.tracks().iter().all(|t| t.is_ended()));
    }
}
