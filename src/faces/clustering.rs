//! Online assignment of faces to person clusters.
//!
//! Each new face joins the person owning its nearest stored face when that
//! face is close enough, and starts a new person otherwise. Matching is
//! against individual member faces, never an averaged centroid. Decisions are
//! greedy and final: two people are never merged afterwards, even when a
//! later face lies close to both of them.

use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use super::distance::{distances_to, nearest};
use crate::config::MatchingConfig;
use crate::db::{PersonId, PersonSlot, RecordStore};
use crate::error::Result;

/// Decides which person a new face belongs to.
#[derive(Clone)]
pub struct ClusterAssigner {
    store: Arc<dyn RecordStore>,
    threshold: f32,
    /// Faces given a person by [`ClusterAssigner::assign`] whose records are
    /// not stored yet, oldest first.
    pending: Arc<Mutex<Vec<Member>>>,
}

#[derive(Clone)]
struct Member {
    embedding: Vec<f32>,
    person: PersonSlot,
}

impl ClusterAssigner {
    pub fn new(store: Arc<dyn RecordStore>, matching: &MatchingConfig) -> Self {
        Self {
            store,
            threshold: matching.person_threshold(),
            pending: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Maximum distance at which a face joins an existing person.
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    fn pending(&self) -> MutexGuard<'_, Vec<Member>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Snapshot the assigned faces so several faces can be assigned in turn,
    /// each one seeing the assignments made before it.
    ///
    /// Stored faces without a person are not members until
    /// [`ClusterAssigner::backfill_unassigned`] gives them one.
    pub fn begin(&self) -> Result<ClusterSession> {
        let mut pending = self.pending();
        self.snapshot(&mut pending)
    }

    fn snapshot(&self, pending: &mut Vec<Member>) -> Result<ClusterSession> {
        let mut members: Vec<Member> = self
            .store
            .all_face_embeddings()?
            .into_iter()
            .filter_map(|face| {
                face.person_id.map(|person_id| Member {
                    embedding: face.embedding,
                    person: PersonSlot::Existing(person_id),
                })
            })
            .collect();

        // a pending face is done once its record is stored
        pending.retain(|p| {
            !members
                .iter()
                .any(|m| m.person == p.person && m.embedding == p.embedding)
        });
        members.extend(pending.iter().cloned());

        Ok(ClusterSession {
            threshold: self.threshold,
            members,
            new_people: 0,
        })
    }

    /// Assign a single embedding, creating the person when it is new.
    ///
    /// The face is remembered until a stored face with the same embedding and
    /// person shows up, so assigning the same embedding again returns the
    /// same person even before the face is written.
    pub fn assign(&self, embedding: &[f32]) -> Result<PersonId> {
        let mut pending = self.pending();
        let person_id = match self.snapshot(&mut pending)?.assign(embedding)? {
            PersonSlot::Existing(person_id) => person_id,
            PersonSlot::New(_) => self.store.create_person()?,
        };

        pending.push(Member {
            embedding: embedding.to_vec(),
            person: PersonSlot::Existing(person_id),
        });
        Ok(person_id)
    }

    /// Give a person to every stored face that has none, oldest face first.
    ///
    /// Callers must serialize this with ingestion.
    pub fn backfill_unassigned(&self) -> Result<usize> {
        let orphans = self.store.unassigned_faces()?;
        if orphans.is_empty() {
            return Ok(0);
        }

        let mut session = self.begin()?;
        let mut created: HashMap<usize, PersonId> = HashMap::new();
        let mut assigned = 0;
        for face in orphans {
            let person_id = match session.assign(&face.embedding)? {
                PersonSlot::Existing(person_id) => person_id,
                PersonSlot::New(slot) => match created.get(&slot) {
                    Some(person_id) => *person_id,
                    None => {
                        let person_id = self.store.create_person()?;
                        created.insert(slot, person_id);
                        person_id
                    }
                },
            };
            if self.store.set_face_person(face.id, person_id)? {
                assigned += 1;
            }
        }

        info!(faces = assigned, "Backfilled person ids");
        Ok(assigned)
    }
}

/// A run of assignments over one snapshot of the stored faces.
///
/// The session never writes: a face that needs a new person gets a
/// `PersonSlot::New`, and the caller creates that person when it stores
/// the face.
pub struct ClusterSession {
    threshold: f32,
    members: Vec<Member>,
    new_people: usize,
}

impl ClusterSession {
    /// Pick the person for `embedding`. The embedding becomes a member of
    /// that person for later calls on this session.
    pub fn assign(&mut self, embedding: &[f32]) -> Result<PersonSlot> {
        let distances = distances_to(
            embedding,
            self.members.par_iter().map(|m| m.embedding.as_slice()),
        )?;

        let person = match nearest(&distances) {
            Some((idx, distance)) if distance <= self.threshold => {
                let person = self.members[idx].person;
                debug!(?person, distance, "Face joins existing person");
                person
            }
            closest => {
                let person = PersonSlot::New(self.new_people);
                self.new_people += 1;
                debug!(
                    ?person,
                    closest = closest.map(|(_, d)| d),
                    "Face starts new person"
                );
                person
            }
        };

        self.members.push(Member {
            embedding: embedding.to_vec(),
            person,
        });
        Ok(person)
    }

    /// Number of faces the session compares against.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// People this session would create.
    pub fn new_people(&self) -> usize {
        self.new_people
    }
}
