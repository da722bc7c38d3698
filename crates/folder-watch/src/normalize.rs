use std::{collections::BTreeSet, path::Path};

use notify::event::{ModifyKind, RenameMode};
use notify::EventKind;

use crate::{path::to_folder_rel_path, types::ChangeBatch};

#[derive(Debug, Default)]
pub(crate) struct PendingBatch {
    created: BTreeSet<String>,
    modified: BTreeSet<String>,
    removed: BTreeSet<String>,
    rescan: bool,
}

impl PendingBatch {
    pub(crate) fn mark_rescan(&mut self) {
        self.rescan = true;
    }

    pub(crate) fn has_emitable_changes(&self) -> bool {
        self.rescan
            || !self.created.is_empty()
            || !self.modified.is_empty()
            || !self.removed.is_empty()
    }

    pub(crate) fn apply_notify_event(&mut self, folder_root: &Path, event: &notify::Event) {
        let rel_paths = event
            .paths
            .iter()
            .filter_map(|path| to_folder_rel_path(folder_root, path))
            .collect::<Vec<_>>();

        match event.kind {
            EventKind::Access(_) => {
                // Access events carry no content change.
            }
            EventKind::Create(_) => {
                self.created.extend(rel_paths);
            }
            EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Metadata(_)) => {
                self.modified.extend(rel_paths);
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                self.handle_rename_both(folder_root, event);
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                // The scanner re-diffs fingerprints, so half a rename is just
                // a removal.
                self.removed.extend(rel_paths);
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                self.created.extend(rel_paths);
            }
            EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Modify(ModifyKind::Other) => {
                self.mark_modified_or_rescan(rel_paths);
            }
            EventKind::Remove(_) => {
                self.removed.extend(rel_paths);
            }
            EventKind::Any | EventKind::Other => {
                self.mark_modified_or_rescan(rel_paths);
            }
        }
    }

    fn mark_modified_or_rescan(&mut self, rel_paths: Vec<String>) {
        if rel_paths.is_empty() {
            self.mark_rescan();
        } else {
            self.modified.extend(rel_paths);
        }
    }

    fn handle_rename_both(&mut self, folder_root: &Path, event: &notify::Event) {
        if event.paths.len() < 2 {
            self.mark_rescan();
            return;
        }

        let from_rel = to_folder_rel_path(folder_root, &event.paths[0]);
        let to_rel = to_folder_rel_path(folder_root, &event.paths[1]);

        match (from_rel, to_rel) {
            (Some(from), Some(to)) => {
                if from == to {
                    self.modified.insert(from);
                } else {
                    self.removed.insert(from);
                    self.created.insert(to);
                }
            }
            (Some(from), None) => {
                self.removed.insert(from);
            }
            (None, Some(to)) => {
                self.created.insert(to);
            }
            (None, None) => {
                self.mark_rescan();
            }
        }
    }

    /// A path that was both created and removed inside one window really
    /// just changed; fold the pair down to a single modification.
    fn fold_create_remove_pairs(&mut self) {
        for rel_path in std::mem::take(&mut self.removed) {
            if self.created.remove(&rel_path) {
                self.modified.insert(rel_path);
            } else {
                self.removed.insert(rel_path);
            }
        }
    }

    fn event_path_count(&self) -> usize {
        self.created.len() + self.modified.len() + self.removed.len()
    }

    pub(crate) fn take_batch(&mut self, seq: u64, max_batch_paths: usize) -> Option<ChangeBatch> {
        if !self.has_emitable_changes() {
            return None;
        }

        self.fold_create_remove_pairs();

        if self.event_path_count() > max_batch_paths {
            // Overflow collapses into a bare rescan request.
            self.created.clear();
            self.modified.clear();
            self.removed.clear();
            self.rescan = true;
        }

        let mut batch = ChangeBatch::empty_with_seq(seq);
        batch.rescan = self.rescan;
        batch.rel_created = std::mem::take(&mut self.created).into_iter().collect();
        batch.rel_modified = std::mem::take(&mut self.modified).into_iter().collect();
        batch.rel_removed = std::mem::take(&mut self.removed).into_iter().collect();
        self.rescan = false;

        if batch.has_payload() {
            Some(batch)
        } else {
            None
        }
    }
}
