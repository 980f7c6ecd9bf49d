// Waiting-job buffers
use super::handler::JobHandler;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Holds jobs that wait for a worker
pub trait JobBuffer: Send {
    fn push(&mut self, handler: Arc<JobHandler>);

    fn pop(&mut self) -> Option<Arc<JobHandler>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&mut self, job_id: &str) -> Option<Arc<JobHandler>>;

    fn drain(&mut self) -> Vec<Arc<JobHandler>>;
}

/// First in, first out
#[derive(Default)]
pub struct FifoBuffer {
    jobs: VecDeque<Arc<JobHandler>>,
}

impl JobBuffer for FifoBuffer {
    fn push(&mut self, handler: Arc<JobHandler>) {
        self.jobs.push_back(handler);
    }

    fn pop(&mut self) -> Option<Arc<JobHandler>> {
        self.jobs.pop_front()
    }

    fn len(&self) -> usize {
        self.jobs.len()
    }

    fn remove(&mut self, job_id: &str) -> Option<Arc<JobHandler>> {
        let index = self.jobs.iter().position(|h| h.id() == job_id)?;
        self.jobs.remove(index)
    }

    fn drain(&mut self) -> Vec<Arc<JobHandler>> {
        self.jobs.drain(..).collect()
    }
}

/// Takes one job per topic in turn
#[derive(Default)]
pub struct TopicRoundRobinBuffer {
    by_topic: HashMap<String, VecDeque<Arc<JobHandler>>>,
    /// Topics with waiting jobs, next one first
    rotation: VecDeque<String>,
    len: usize,
}

impl JobBuffer for TopicRoundRobinBuffer {
    fn push(&mut self, handler: Arc<JobHandler>) {
        let topic = handler.topic();
        let jobs = self.by_topic.entry(topic.clone()).or_default();
        if jobs.is_empty() {
            self.rotation.push_back(topic);
        }
        jobs.push_back(handler);
        self.len += 1;
    }

    fn pop(&mut self) -> Option<Arc<JobHandler>> {
        let topic = self.rotation.pop_front()?;
        let jobs = self.by_topic.get_mut(&topic)?;
        let handler = jobs.pop_front();
        if jobs.is_empty() {
            self.by_topic.remove(&topic);
        } else {
            self.rotation.push_back(topic);
        }
        if handler.is_some() {
            self.len -= 1;
        }
        handler
    }

    fn len(&self) -> usize {
        self.len
    }

    fn remove(&mut self, job_id: &str) -> Option<Arc<JobHandler>> {
        let (topic, index) = self.by_topic.iter().find_map(|(topic, jobs)| {
            jobs.iter()
                .position(|h| h.id() == job_id)
                .map(|index| (topic.clone(), index))
        })?;
        let jobs = self.by_topic.get_mut(&topic)?;
        let handler = jobs.remove(index);
        if jobs.is_empty() {
            self.by_topic.remove(&topic);
            self.rotation.retain(|t| t != &topic);
        }
        if handler.is_some() {
            self.len -= 1;
        }
        handler
    }

    fn drain(&mut self) -> Vec<Arc<JobHandler>> {
        let mut drained = Vec::with_capacity(self.len);
        while let Some(handler) = self.pop() {
            drained.push(handler);
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Job, JobProperties};

    fn handler(id: &str, topic: &str) -> Arc<JobHandler> {
        JobHandler::new(Job {
            id: id.into(),
            topic: topic.into(),
            name: None,
            path: format!("/jobs/{}", id),
            queue_name: None,
            created_at: 0,
            created_instance: None,
            target_instance: None,
            retry_count: 0,
            max_retries: 0,
            queued_at: None,
            started_at: None,
            finished_state: None,
            finished_at: None,
            result_message: None,
            properties: JobProperties::new(),
            read_errors: Vec::new(),
        })
    }

    fn ids(buffer: &mut dyn JobBuffer) -> Vec<String> {
        buffer.drain().iter().map(|h| h.id()).collect()
    }

    #[test]
    fn test_fifo_order_and_remove() {
        let mut buffer = FifoBuffer::default();
        for id in ["1", "2", "3"] {
            buffer.push(handler(id, "t"));
        }
        assert_eq!(buffer.remove("2").unwrap().id(), "2");
        assert!(buffer.remove("2").is_none());
        assert_eq!(ids(&mut buffer), vec!["1", "3"]);
    }

    #[test]
    fn test_round_robin_alternates_topics() {
        let mut buffer = TopicRoundRobinBuffer::default();
        for (id, topic) in [("a1", "a"), ("a2", "a"), ("a3", "a"), ("b1", "b"), ("c1", "c")] {
            buffer.push(handler(id, topic));
        }
        assert_eq!(buffer.len(), 5);
        assert_eq!(ids(&mut buffer), vec!["a1", "b1", "c1", "a2", "a3"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_round_robin_remove_drops_empty_topic() {
        let mut buffer = TopicRoundRobinBuffer::default();
        buffer.push(handler("a1", "a"));
        buffer.push(handler("b1", "b"));
        assert!(buffer.remove("a1").is_some());
        assert_eq!(buffer.len(), 1);
        assert_eq!(ids(&mut buffer), vec!["b1"]);
    }
}
