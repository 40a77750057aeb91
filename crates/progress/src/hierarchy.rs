//! Content Hierarchy Store - read-only course index.
//!
//! Course structures come from the content-generation collaborator through
//! a [`ContentSource`]. Once fetched, a course version is immutable, so the
//! [`HierarchyIndex`] only ever grows or swaps whole courses.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use coursetrack_core::{Course, CourseId, CourseStructure, LessonId, SectionId};
use coursetrack_storage::CourseStore;

use crate::error::{ProgressError, Result};

/// Supplier of course structures (`getCourseStructure`).
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Structure of a course, or `None` if the collaborator does not know it.
    async fn get_course_structure(&self, course_id: &CourseId) -> Result<Option<CourseStructure>>;

    /// Ids of every course the collaborator can supply.
    async fn list_course_ids(&self) -> Result<Vec<CourseId>>;
}

/// Fixed set of course structures held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticContentSource {
    courses: HashMap<CourseId, CourseStructure>,
}

impl StaticContentSource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a course structure.
    pub fn with_course(mut self, id: impl Into<CourseId>, structure: CourseStructure) -> Self {
        self.courses.insert(id.into(), structure);
        self
    }
}

#[async_trait]
impl ContentSource for StaticContentSource {
    async fn get_course_structure(&self, course_id: &CourseId) -> Result<Option<CourseStructure>> {
        Ok(self.courses.get(course_id).cloned())
    }

    async fn list_course_ids(&self) -> Result<Vec<CourseId>> {
        let mut ids: Vec<CourseId> = self.courses.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// Content source backed by courses imported into a [`CourseStore`].
pub struct StoreContentSource {
    store: Arc<dyn CourseStore>,
}

impl StoreContentSource {
    /// Wrap a course store.
    pub fn new(store: Arc<dyn CourseStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ContentSource for StoreContentSource {
    async fn get_course_structure(&self, course_id: &CourseId) -> Result<Option<CourseStructure>> {
        Ok(self
            .store
            .load_course(course_id)
            .await?
            .map(|course| course.to_structure()))
    }

    async fn list_course_ids(&self) -> Result<Vec<CourseId>> {
        Ok(self
            .store
            .list_courses()
            .await?
            .into_iter()
            .map(|course| course.id)
            .collect())
    }
}

/// Where a section sits in its course.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionLocation {
    /// Owning course
    pub course_id: CourseId,

    /// Owning lesson
    pub lesson_id: LessonId,

    /// Position of the lesson within the course
    pub lesson_index: usize,

    /// Position of the section in global course order
    pub global_index: usize,
}

/// Index of loaded courses and of the sections they contain.
///
/// Progress events only carry a section id, so section ids must be unique
/// across every indexed course.
#[derive(Debug, Default)]
pub struct HierarchyIndex {
    courses: HashMap<CourseId, Arc<Course>>,
    sections: HashMap<SectionId, SectionLocation>,
}

impl HierarchyIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a course.
    ///
    /// Fails if one of its sections already belongs to a different course.
    pub fn insert(&mut self, course: Course) -> Result<Arc<Course>> {
        for section in course.sections() {
            if let Some(existing) = self.sections.get(&section.id) {
                if existing.course_id != course.id {
                    return Err(ProgressError::Content(format!(
                        "section {} already belongs to course {}",
                        section.id, existing.course_id
                    )));
                }
            }
        }

        if let Some(previous) = self.courses.remove(&course.id) {
            for section in previous.sections() {
                self.sections.remove(&section.id);
            }
        }

        let mut global_index = 0;
        for (lesson_index, lesson) in course.lessons.iter().enumerate() {
            for section in &lesson.sections {
                self.sections.insert(
                    section.id.clone(),
                    SectionLocation {
                        course_id: course.id.clone(),
                        lesson_id: lesson.id.clone(),
                        lesson_index,
                        global_index,
                    },
                );
                global_index += 1;
            }
        }

        let course = Arc::new(course);
        self.courses.insert(course.id.clone(), course.clone());
        Ok(course)
    }

    /// Get a loaded course.
    pub fn course(&self, id: &CourseId) -> Option<Arc<Course>> {
        self.courses.get(id).cloned()
    }

    /// Locate a section.
    pub fn locate(&self, section: &SectionId) -> Option<&SectionLocation> {
        self.sections.get(section)
    }

    /// Whether a course is loaded.
    pub fn contains_course(&self, id: &CourseId) -> bool {
        self.courses.contains_key(id)
    }

    /// Number of loaded courses.
    pub fn course_count(&self) -> usize {
        self.courses.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coursetrack_core::{LessonOutline, SectionOutline};

    fn structure(lessons: &[(&str, &[&str])]) -> CourseStructure {
        CourseStructure {
            version: 1,
            lessons: lessons
                .iter()
                .enumerate()
                .map(|(i, (id, sections))| LessonOutline {
                    id: LessonId::new(*id),
                    order: i as u32,
                    sections: sections
                        .iter()
                        .enumerate()
                        .map(|(j, sid)| SectionOutline {
                            id: SectionId::new(*sid),
                            order: j as u32,
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    #[test]
    fn locates_sections_in_global_order() {
        let course = Course::from_structure(
            "c".into(),
            structure(&[("l1", &["a", "b"]), ("l2", &["c", "d"])]),
        )
        .unwrap();
        let mut index = HierarchyIndex::new();
        index.insert(course).unwrap();

        let loc = index.locate(&"c".into()).unwrap();
        assert_eq!(loc.lesson_id, LessonId::new("l2"));
        assert_eq!(loc.lesson_index, 1);
        assert_eq!(loc.global_index, 2);
        assert!(index.locate(&"zzz".into()).is_none());
    }

    #[test]
    fn rejects_section_shared_between_courses() {
        let mut index = HierarchyIndex::new();
        let first = Course::from_structure("c1".into(), structure(&[("l1", &["a"])])).unwrap();
        let second = Course::from_structure("c2".into(), structure(&[("l9", &["a"])])).unwrap();

        index.insert(first).unwrap();
        assert!(matches!(index.insert(second), Err(ProgressError::Content(_))));
        assert_eq!(index.course_count(), 1);
    }

    #[test]
    fn replacing_a_course_drops_its_old_sections() {
        let mut index = HierarchyIndex::new();
        let v1 = Course::from_structure("c".into(), structure(&[("l1", &["a", "b"])])).unwrap();
        let v2 = Course::from_structure("c".into(), structure(&[("l1", &["a", "x"])])).unwrap();

        index.insert(v1).unwrap();
        index.insert(v2).unwrap();
        assert!(index.locate(&"b".into()).is_none());
        assert!(index.locate(&"x".into()).is_some());
    }

    #[tokio::test]
    async fn store_source_serves_imported_courses() {
        let store = Arc::new(coursetrack_storage::MemoryStorage::new());
        let course = Course::from_structure("c".into(), structure(&[("l1", &["a"])])).unwrap();
        store.save_course(&course).await.unwrap();

        let source = StoreContentSource::new(store);
        assert_eq!(source.list_course_ids().await.unwrap(), vec![CourseId::new("c")]);
        assert_eq!(
            source.get_course_structure(&"c".into()).await.unwrap(),
            Some(course.to_structure())
        );
    }
}
