use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{RenderQueueError, Result};
use crate::scheduler::job::{Job, JobId, JobStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveDirection {
    Up,
    Down,
}

/// Ordered render queue.
///
/// Order matters: it breaks ties between jobs with equal attempts and is
/// what gets persisted. At most one job may be `Rendering` at any time.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: Vec<Job>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a queue from a loaded snapshot, dropping duplicate identities.
    pub fn from_jobs(jobs: Vec<Job>) -> Self {
        let mut seen = HashSet::new();
        let jobs = jobs
            .into_iter()
            .filter(|job| {
                let fresh = seen.insert(job.id);
                if !fresh {
                    tracing::warn!(
                        path = %job.path.display(),
                        "Duplicate job in snapshot, dropped"
                    );
                }
                fresh
            })
            .collect();
        Self { jobs }
    }

    pub fn add_job(&mut self, job: Job) -> Result<()> {
        if self.get_job(&job.id).is_some() {
            return Err(RenderQueueError::DuplicateJob(job.path));
        }
        self.jobs.push(job);
        Ok(())
    }

    pub fn get_job(&self, id: &JobId) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == *id)
    }

    /// Direct mutable access for fixtures; status changes outside tests go
    /// through [`JobQueue::transition`].
    #[cfg(test)]
    pub(crate) fn get_job_mut(&mut self, id: &JobId) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == *id)
    }

    fn position(&self, id: &JobId) -> Result<usize> {
        self.jobs
            .iter()
            .position(|j| j.id == *id)
            .ok_or_else(|| RenderQueueError::JobNotFound(id.to_string()))
    }

    /// All jobs in queue order.
    pub fn all_jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn rendering_job(&self) -> Option<&Job> {
        self.jobs.iter().find(|j| j.status == JobStatus::Rendering)
    }

    pub fn count_with_status(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }

    /// Pick the next job to dispatch: fewest attempts among dispatchable
    /// jobs, ties broken by queue order.
    pub fn next_eligible(&self, auto_retry: bool, exclude: &HashSet<JobId>) -> Option<JobId> {
        self.jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| j.status.is_dispatchable(auto_retry) && !exclude.contains(&j.id))
            .min_by_key(|(index, j)| (j.attempts, *index))
            .map(|(_, j)| j.id)
    }

    /// Apply a lifecycle transition, rejecting anything the table forbids
    /// and any second `Rendering` job.
    pub(crate) fn transition(&mut self, id: &JobId, next: JobStatus) -> Result<&mut Job> {
        if next == JobStatus::Rendering {
            if let Some(active) = self.rendering_job() {
                if active.id != *id {
                    return Err(RenderQueueError::InvariantViolation(format!(
                        "{} is already rendering",
                        active.display_name()
                    )));
                }
            }
        }
        let index = self.position(id)?;
        let job = &mut self.jobs[index];
        if !job.status.can_transition_to(next) {
            return Err(RenderQueueError::InvariantViolation(format!(
                "cannot move {} from {} to {}",
                job.display_name(),
                job.status,
                next
            )));
        }
        job.status = next;
        Ok(job)
    }

    /// Move a job to the end of the queue.
    pub fn move_to_tail(&mut self, id: &JobId) -> Result<()> {
        let index = self.position(id)?;
        let job = self.jobs.remove(index);
        self.jobs.push(job);
        Ok(())
    }

    /// Swap a job with its neighbour. Rendering jobs stay where they are.
    pub fn move_job(&mut self, id: &JobId, direction: MoveDirection) -> Result<()> {
        let index = self.position(id)?;
        self.ensure_not_rendering(index, "move")?;
        let target = match direction {
            MoveDirection::Up => index.checked_sub(1),
            MoveDirection::Down => Some(index + 1).filter(|&i| i < self.jobs.len()),
        };
        match target {
            Some(target) => {
                self.jobs.swap(index, target);
                Ok(())
            }
            None => Err(RenderQueueError::InvariantViolation(format!(
                "{} is already at the {} of the queue",
                self.jobs[index].display_name(),
                if direction == MoveDirection::Up {
                    "top"
                } else {
                    "bottom"
                }
            ))),
        }
    }

    pub fn remove_job(&mut self, id: &JobId) -> Result<Job> {
        let index = self.position(id)?;
        self.ensure_not_rendering(index, "remove")?;
        Ok(self.jobs.remove(index))
    }

    /// Remove every job except a rendering one. Returns the number removed.
    pub fn remove_all(&mut self) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|j| j.status == JobStatus::Rendering);
        before - self.jobs.len()
    }

    /// Reset a job to `Ready` with a clean attempt counter.
    pub fn reset_job(&mut self, id: &JobId) -> Result<&Job> {
        let index = self.position(id)?;
        self.ensure_not_rendering(index, "reset")?;
        let job = &mut self.jobs[index];
        job.reset();
        Ok(job)
    }

    /// Reset every non-rendering job matching `filter`. Returns how many
    /// jobs actually changed.
    pub fn reset_where(&mut self, filter: impl Fn(&Job) -> bool) -> usize {
        let mut changed = 0;
        for job in self
            .jobs
            .iter_mut()
            .filter(|j| j.status != JobStatus::Rendering && filter(j))
        {
            let before = job.clone();
            job.reset();
            if *job != before {
                changed += 1;
            }
        }
        changed
    }

    pub fn reset_all(&mut self) -> usize {
        self.reset_where(|_| true)
    }

    pub fn clear_done(&mut self) -> usize {
        self.reset_where(|j| j.status == JobStatus::Done)
    }

    fn ensure_not_rendering(&self, index: usize, action: &str) -> Result<()> {
        let job = &self.jobs[index];
        if job.status == JobStatus::Rendering {
            return Err(RenderQueueError::InvariantViolation(format!(
                "cannot {} {} while it is rendering",
                action,
                job.display_name()
            )));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn queue_of(names: &[&str]) -> (JobQueue, Vec<JobId>) {
        let mut queue = JobQueue::new();
        let mut ids = Vec::new();
        for name in names {
            let job = Job::new(PathBuf::from(format!("/scenes/{}.blend", name)));
            ids.push(job.id);
            queue.add_job(job).unwrap();
        }
        (queue, ids)
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let (mut queue, _) = queue_of(&["a"]);
        let err = queue
            .add_job(Job::new(PathBuf::from("/scenes/a.blend")))
            .unwrap_err();
        assert!(matches!(err, RenderQueueError::DuplicateJob(_)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn next_eligible_prefers_fewest_attempts_then_order() {
        let (mut queue, ids) = queue_of(&["a", "b", "c"]);
        let none = HashSet::new();
        assert_eq!(queue.next_eligible(false, &none), Some(ids[0]));

        queue.get_job_mut(&ids[0]).unwrap().attempts = 1;
        assert_eq!(queue.next_eligible(false, &none), Some(ids[1]));

        queue.get_job_mut(&ids[1]).unwrap().attempts = 1;
        queue.get_job_mut(&ids[2]).unwrap().attempts = 1;
        assert_eq!(queue.next_eligible(false, &none), Some(ids[0]));
    }

    #[test]
    fn next_eligible_respects_mode_and_exclusions() {
        let (mut queue, ids) = queue_of(&["a", "b"]);
        queue.get_job_mut(&ids[0]).unwrap().status = JobStatus::Canceled;
        queue.get_job_mut(&ids[1]).unwrap().status = JobStatus::Done;
        assert_eq!(queue.next_eligible(false, &HashSet::new()), Some(ids[0]));
        assert_eq!(queue.next_eligible(true, &HashSet::new()), None);

        let excluded: HashSet<JobId> = [ids[0]].into_iter().collect();
        assert_eq!(queue.next_eligible(false, &excluded), None);
    }

    #[test]
    fn second_rendering_job_is_rejected() {
        let (mut queue, ids) = queue_of(&["a", "b"]);
        queue.transition(&ids[0], JobStatus::Rendering).unwrap();
        let err = queue.transition(&ids[1], JobStatus::Rendering).unwrap_err();
        assert!(matches!(err, RenderQueueError::InvariantViolation(_)));
        assert_eq!(queue.count_with_status(JobStatus::Rendering), 1);
        assert_eq!(queue.get_job(&ids[1]).unwrap().status, JobStatus::Ready);
    }

    #[test]
    fn illegal_transition_leaves_job_untouched() {
        let (mut queue, ids) = queue_of(&["a"]);
        assert!(queue.transition(&ids[0], JobStatus::Done).is_err());
        assert_eq!(queue.get_job(&ids[0]).unwrap().status, JobStatus::Ready);
    }

    #[test]
    fn move_to_tail_changes_order() {
        let (mut queue, ids) = queue_of(&["a", "b", "c"]);
        queue.move_to_tail(&ids[0]).unwrap();
        let order: Vec<JobId> = queue.all_jobs().iter().map(|j| j.id).collect();
        assert_eq!(order, vec![ids[1], ids[2], ids[0]]);
    }

    #[test]
    fn move_job_swaps_neighbours_within_bounds() {
        let (mut queue, ids) = queue_of(&["a", "b"]);
        queue.move_job(&ids[1], MoveDirection::Up).unwrap();
        assert_eq!(queue.all_jobs()[0].id, ids[1]);
        assert!(queue.move_job(&ids[1], MoveDirection::Up).is_err());
        assert!(queue.move_job(&ids[0], MoveDirection::Down).is_err());
    }

    #[test]
    fn rendering_job_cannot_be_moved_removed_or_reset() {
        let (mut queue, ids) = queue_of(&["a", "b"]);
        queue.transition(&ids[0], JobStatus::Rendering).unwrap();
        assert!(queue.move_job(&ids[0], MoveDirection::Down).is_err());
        assert!(queue.remove_job(&ids[0]).is_err());
        assert!(queue.reset_job(&ids[0]).is_err());
        assert_eq!(queue.remove_all(), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.all_jobs()[0].id, ids[0]);
    }

    #[test]
    fn reset_restores_pristine_state() {
        let (mut queue, ids) = queue_of(&["a"]);
        {
            let job = queue.get_job_mut(&ids[0]).unwrap();
            job.status = JobStatus::Error;
            job.attempts = 4;
            job.last_duration = Some(Duration::from_secs(30));
        }
        let job = queue.reset_job(&ids[0]).unwrap();
        assert_eq!(job.status, JobStatus::Ready);
        assert_eq!(job.attempts, 0);
        assert!(job.last_duration.is_none());
    }

    #[test]
    fn clear_done_only_touches_done_jobs() {
        let (mut queue, ids) = queue_of(&["a", "b", "c"]);
        queue.get_job_mut(&ids[0]).unwrap().status = JobStatus::Done;
        queue.get_job_mut(&ids[1]).unwrap().status = JobStatus::Error;
        assert_eq!(queue.clear_done(), 1);
        assert_eq!(queue.get_job(&ids[0]).unwrap().status, JobStatus::Ready);
        assert_eq!(queue.get_job(&ids[1]).unwrap().status, JobStatus::Error);

        assert_eq!(queue.reset_all(), 1);
        assert_eq!(queue.count_with_status(JobStatus::Ready), 3);
    }

    #[test]
    fn from_jobs_drops_duplicates() {
        let a = Job::new(PathBuf::from("/scenes/a.blend"));
        let queue = JobQueue::from_jobs(vec![a.clone(), a]);
        assert_eq!(queue.len(), 1);
    }
}
