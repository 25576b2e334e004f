//! Object builders over the sample model. Objects come back transient unless
//! the helper says otherwise.

use objstate_core::{FieldData, ObjectId, Value};
use objstate_engine::{EngineError, ExecutionContext};

use crate::model::{author, book, chapter, library, shelf};

pub fn new_author(ctx: &mut ExecutionContext, name: &str) -> Result<ObjectId, EngineError> {
    let id = ctx.new_object(author::CLASS)?;
    ctx.set_field(id, author::NAME, FieldData::Scalar(name.into()))?;
    Ok(id)
}

pub fn new_book(
    ctx: &mut ExecutionContext,
    title: &str,
    tags: &[&str],
) -> Result<ObjectId, EngineError> {
    let id = ctx.new_object(book::CLASS)?;
    ctx.set_field(id, book::TITLE, FieldData::Scalar(title.into()))?;
    for tag in tags {
        ctx.collection_add(id, book::TAGS, *tag)?;
    }
    Ok(id)
}

pub fn new_chapter(
    ctx: &mut ExecutionContext,
    heading: &str,
    pages: i64,
) -> Result<ObjectId, EngineError> {
    let id = ctx.new_object(chapter::CLASS)?;
    ctx.set_field(id, chapter::HEADING, FieldData::Scalar(heading.into()))?;
    ctx.set_field(id, chapter::PAGES, FieldData::Scalar(Value::Integer(pages)))?;
    Ok(id)
}

pub fn new_library(ctx: &mut ExecutionContext, name: &str) -> Result<ObjectId, EngineError> {
    let id = ctx.new_object(library::CLASS)?;
    ctx.set_field(id, library::NAME, FieldData::Scalar(name.into()))?;
    Ok(id)
}

pub fn new_shelf(ctx: &mut ExecutionContext, label: &str) -> Result<ObjectId, EngineError> {
    let id = ctx.new_object(shelf::CLASS)?;
    ctx.set_field(id, shelf::LABEL, FieldData::Scalar(label.into()))?;
    Ok(id)
}

/// A book with `chapters` chapters, persisted and committed in its own
/// transaction. Returns the book and its chapters in list order.
pub fn committed_book(
    ctx: &mut ExecutionContext,
    title: &str,
    tags: &[&str],
    chapters: usize,
) -> Result<(ObjectId, Vec<ObjectId>), EngineError> {
    ctx.begin()?;
    let id = new_book(ctx, title, tags)?;
    let mut chapter_ids = Vec::with_capacity(chapters);
    for n in 0..chapters {
        let chapter_id = new_chapter(ctx, &format!("Chapter {}", n + 1), 10)?;
        ctx.collection_add(id, book::CHAPTERS, chapter_id)?;
        chapter_ids.push(chapter_id);
    }
    ctx.persist(id)?;
    ctx.commit()?;
    Ok((id, chapter_ids))
}

/// A library holding one shelf per label, committed.
pub fn committed_library(
    ctx: &mut ExecutionContext,
    name: &str,
    shelf_labels: &[&str],
) -> Result<(ObjectId, Vec<ObjectId>), EngineError> {
    ctx.begin()?;
    let id = new_library(ctx, name)?;
    let mut shelves = Vec::with_capacity(shelf_labels.len());
    for label in shelf_labels {
        let shelf_id = new_shelf(ctx, label)?;
        ctx.map_put(id, library::SHELVES, *label, shelf_id)?;
        shelves.push(shelf_id);
    }
    ctx.persist(id)?;
    ctx.commit()?;
    Ok((id, shelves))
}
