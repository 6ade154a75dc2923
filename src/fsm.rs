//! The music queue: the deterministic finite-state machine fed by
//! committed log entries.

use crate::message::{CommandKind, Track};

#[derive(Debug, Default)]
pub struct MusicQueue {
    tracks: Vec<Track>,
}

impl MusicQueue {
    pub fn new() -> Self {
        Self { tracks: Vec::new() }
    }

    /// Deterministic given the log prefix: ADD of a present id and REMOVE
    /// of an absent id are both no-ops. Duplicate detection lives here,
    /// not in the Raft layer. Commands arrive as a typed `CommandKind`, not
    /// an opaque payload, so there is no decode step that can fail.
    pub fn apply(&mut self, command: &CommandKind) {
        match command {
            CommandKind::Add(track) => {
                if !self.tracks.iter().any(|t| t.id == track.id) {
                    self.tracks.push(track.clone());
                }
            }
            CommandKind::Remove(track_id) => {
                self.tracks.retain(|t| t.id != track_id.0);
            }
        }
    }

    /// Read view. Reads are local and need not reflect in-flight
    /// proposals.
    pub fn snapshot(&self) -> Vec<Track> {
        self.tracks.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TrackId;

    fn track(id: u64) -> Track {
        Track { id, title: format!("song-{id}"), artist: "artist".into() }
    }

    #[test]
    fn add_appends_new_track() {
        let mut q = MusicQueue::new();
        q.apply(&CommandKind::Add(track(1)));
        assert_eq!(q.snapshot(), vec![track(1)]);
    }

    #[test]
    fn add_of_existing_id_is_a_noop() {
        let mut q = MusicQueue::new();
        q.apply(&CommandKind::Add(track(1)));
        q.apply(&CommandKind::Add(track(1)));
        assert_eq!(q.snapshot(), vec![track(1)]);
    }

    #[test]
    fn remove_of_absent_id_is_a_noop() {
        let mut q = MusicQueue::new();
        q.apply(&CommandKind::Add(track(1)));
        q.apply(&CommandKind::Remove(TrackId(99)));
        assert_eq!(q.snapshot(), vec![track(1)]);
    }

    #[test]
    fn remove_deletes_matching_id() {
        let mut q = MusicQueue::new();
        q.apply(&CommandKind::Add(track(1)));
        q.apply(&CommandKind::Add(track(2)));
        q.apply(&CommandKind::Remove(TrackId(1)));
        assert_eq!(q.snapshot(), vec![track(2)]);
    }

    #[test]
    fn application_order_is_preserved() {
        let mut q = MusicQueue::new();
        for id in [3, 1, 2] {
            q.apply(&CommandKind::Add(track(id)));
        }
        assert_eq!(q.snapshot(), vec![track(3), track(1), track(2)]);
    }
}
