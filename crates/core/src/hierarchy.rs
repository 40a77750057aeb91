//! Content hierarchy - course, lesson and section structure.
//!
//! The hierarchy is produced by the content-generation collaborator and is
//! immutable once fetched for a given course version. [`CourseStructure`] is
//! the shape we receive; [`Course`] is the validated, ordered form the engine
//! works with.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::id::{CourseId, LessonId, SectionId};

/// Errors raised while validating a course structure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HierarchyError {
    /// Course has no sections at all
    #[error("course {0} has no sections")]
    EmptyCourse(CourseId),

    /// Lesson has no sections
    #[error("lesson {0} has no sections")]
    EmptyLesson(LessonId),

    /// Lesson id appears twice
    #[error("duplicate lesson id: {0}")]
    DuplicateLesson(LessonId),

    /// Section id appears twice (sections have exactly one parent)
    #[error("duplicate section id: {0}")]
    DuplicateSection(SectionId),

    /// Two siblings share the same order value
    #[error("duplicate order {order} under {parent}")]
    DuplicateOrder {
        /// Parent course or lesson id
        parent: String,
        /// Offending order value
        order: u32,
    },

    /// Sibling order values are not contiguous
    #[error("order under {parent} is not dense: expected {expected}, found {found}")]
    SparseOrder {
        /// Parent course or lesson id
        parent: String,
        /// Expected order value
        expected: u32,
        /// Order value found instead
        found: u32,
    },
}

/// Course structure as supplied by `getCourseStructure(courseId)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseStructure {
    /// Content version; bumps whenever the collaborator republishes the course
    #[serde(default)]
    pub version: u32,

    /// Lessons (any order; `order` decides)
    pub lessons: Vec<LessonOutline>,
}

/// Lesson entry in a [`CourseStructure`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonOutline {
    /// Lesson id
    pub id: LessonId,

    /// Position within the course
    pub order: u32,

    /// Sections of this lesson
    pub sections: Vec<SectionOutline>,
}

/// Section entry in a [`LessonOutline`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionOutline {
    /// Section id
    pub id: SectionId,

    /// Position within the lesson
    pub order: u32,
}

/// A validated course with lessons and sections sorted by order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    /// Course id
    pub id: CourseId,

    /// Content version this course was built from
    pub version: u32,

    /// Lessons in course order
    pub lessons: Vec<Lesson>,
}

/// A lesson - an ordered group of sections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    /// Lesson id
    pub id: LessonId,

    /// Parent course
    pub course_id: CourseId,

    /// Position within the course
    pub order: u32,

    /// Sections in lesson order
    pub sections: Vec<Section>,
}

/// A section - the smallest unit of completion tracking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    /// Section id
    pub id: SectionId,

    /// Parent lesson
    pub lesson_id: LessonId,

    /// Position within the lesson
    pub order: u32,
}

impl Course {
    /// Validate a structure and build the ordered course from it.
    pub fn from_structure(id: CourseId, structure: CourseStructure) -> Result<Self, HierarchyError> {
        let mut outlines = structure.lessons;
        outlines.sort_by_key(|l| l.order);
        check_dense(id.as_str(), outlines.iter().map(|l| l.order))?;

        let mut lesson_ids = HashSet::new();
        let mut section_ids = HashSet::new();
        let mut lessons = Vec::with_capacity(outlines.len());

        for outline in outlines {
            if !lesson_ids.insert(outline.id.clone()) {
                return Err(HierarchyError::DuplicateLesson(outline.id));
            }
            if outline.sections.is_empty() {
                return Err(HierarchyError::EmptyLesson(outline.id));
            }

            let mut sections = outline.sections;
            sections.sort_by_key(|s| s.order);
            check_dense(outline.id.as_str(), sections.iter().map(|s| s.order))?;

            let mut built = Vec::with_capacity(sections.len());
            for section in sections {
                if !section_ids.insert(section.id.clone()) {
                    return Err(HierarchyError::DuplicateSection(section.id));
                }
                built.push(Section {
                    id: section.id,
                    lesson_id: outline.id.clone(),
                    order: section.order,
                });
            }

            lessons.push(Lesson {
                id: outline.id,
                course_id: id.clone(),
                order: outline.order,
                sections: built,
            });
        }

        if lessons.is_empty() {
            return Err(HierarchyError::EmptyCourse(id));
        }

        Ok(Self {
            id,
            version: structure.version,
            lessons,
        })
    }

    /// Convert back to the collaborator's structure shape.
    pub fn to_structure(&self) -> CourseStructure {
        CourseStructure {
            version: self.version,
            lessons: self
                .lessons
                .iter()
                .map(|lesson| LessonOutline {
                    id: lesson.id.clone(),
                    order: lesson.order,
                    sections: lesson
                        .sections
                        .iter()
                        .map(|s| SectionOutline {
                            id: s.id.clone(),
                            order: s.order,
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    /// All sections in global course order.
    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.lessons.iter().flat_map(|l| l.sections.iter())
    }

    /// Total number of sections in the course.
    pub fn section_count(&self) -> usize {
        self.lessons.iter().map(|l| l.sections.len()).sum()
    }
}

fn check_dense(parent: &str, orders: impl Iterator<Item = u32>) -> Result<(), HierarchyError> {
    let mut previous: Option<u32> = None;
    for order in orders {
        if let Some(prev) = previous {
            if order == prev {
                return Err(HierarchyError::DuplicateOrder {
                    parent: parent.to_string(),
                    order,
                });
            }
            if order != prev + 1 {
                return Err(HierarchyError::SparseOrder {
                    parent: parent.to_string(),
                    expected: prev + 1,
                    found: order,
                });
            }
        }
        previous = Some(order);
    }
    Ok(())
}
