use objstate_core::{FieldData, LifecycleState, ObjectId, Value};
use objstate_engine::{DetachedGraph, DetachedObject, EngineError};
use objstate_harness::fixtures::{committed_book, new_book, new_chapter};
use objstate_harness::model::{author, book};
use objstate_harness::{TestSession, sorted};

// ============================================================================
// Detach
// ============================================================================

#[test]
fn detach_flushes_pending_work_and_unbinds() -> Result<(), Box<dyn std::error::Error>> {
    let session = TestSession::new()?;
    let (mut ctx, probe) = session.open()?;

    ctx.begin()?;
    let dune = new_book(&mut ctx, "Dune", &["scifi"])?;
    let prologue = new_chapter(&mut ctx, "Prologue", 3)?;
    ctx.collection_add(dune, book::CHAPTERS, prologue)?;
    ctx.persist(dune)?;

    let graph = ctx.detach(dune)?;
    assert_eq!(probe.counts().inserts, 2);
    assert_eq!(graph.len(), 2);
    assert_eq!(
        graph.root_object().map(|o| o.class_name.as_str()),
        Some(book::CLASS)
    );
    for id in [dune, prologue] {
        assert!(!ctx.is_managed(id));
        assert_eq!(session.runtime().ownership().owner_of(id), None);
    }

    ctx.commit()?;
    assert!(session.stored(book::CLASS, dune)?.is_some());
    Ok(())
}

#[test]
fn detach_copy_keeps_originals_managed() -> Result<(), Box<dyn std::error::Error>> {
    let session = TestSession::new()?;
    let (mut ctx, _) = session.open()?;
    let (dune, chapters) = committed_book(&mut ctx, "Dune", &["scifi"], 2)?;

    let graph = ctx.detach_copy(dune)?;
    assert_eq!(graph.len(), 3);
    assert!(chapters.iter().all(|id| graph.get(*id).is_some()));
    assert_eq!(ctx.lifecycle(dune), Some(LifecycleState::PersistentClean));
    let title = graph.get(dune).and_then(|o| o.field(book::TITLE));
    assert_eq!(title, Some(&FieldData::Scalar("Dune".into())));
    Ok(())
}

// ============================================================================
// Attach
// ============================================================================

#[test]
fn unmodified_copy_attaches_without_writes_in_same_context()
-> Result<(), Box<dyn std::error::Error>> {
    let session = TestSession::new()?;
    let (mut ctx, probe) = session.open()?;
    let (dune, _) = committed_book(&mut ctx, "Dune", &["scifi"], 2)?;
    let graph = ctx.detach_copy(dune)?;
    probe.reset();

    ctx.begin()?;
    assert_eq!(ctx.attach_copy(&graph)?, dune);
    assert_eq!(ctx.lifecycle(dune), Some(LifecycleState::PersistentClean));
    ctx.commit()?;

    let counts = probe.counts();
    assert_eq!(counts.reads(), 0);
    assert_eq!(counts.writes(), 0);
    Ok(())
}

#[test]
fn unmodified_copy_attaches_without_writes_across_contexts()
-> Result<(), Box<dyn std::error::Error>> {
    let session = TestSession::new()?;
    let (mut writer, _) = session.open()?;
    let (mut reader, probe) = session.open()?;
    let (dune, _) = committed_book(&mut writer, "Dune", &["scifi"], 2)?;
    let graph = writer.detach_copy(dune)?;
    writer.close()?;

    reader.begin()?;
    reader.attach_copy(&graph)?;
    reader.commit()?;

    let counts = probe.counts();
    assert!(counts.reads() > 0);
    assert_eq!(counts.writes(), 0);
    assert_eq!(reader.managed_count(), graph.len());
    Ok(())
}

#[test]
fn modified_copy_applies_its_changes() -> Result<(), Box<dyn std::error::Error>> {
    let session = TestSession::new()?;
    let (mut ctx, probe) = session.open()?;
    let (dune, _) = committed_book(&mut ctx, "Dune", &["scifi"], 1)?;
    let mut graph = ctx.detach(dune)?;

    let detached = graph.get_mut(dune).ok_or("book not in graph")?;
    *detached
        .field_mut(book::TITLE)
        .ok_or("title not detached")? = FieldData::Scalar("Dune (revised)".into());
    if let Some(FieldData::Collection(tags)) = detached.field_mut(book::TAGS) {
        tags.push(Value::from("classic"));
    }
    probe.reset();

    ctx.begin()?;
    ctx.attach_copy(&graph)?;
    assert_eq!(ctx.lifecycle(dune), Some(LifecycleState::PersistentDirty));
    ctx.commit()?;

    assert_eq!(probe.counts().updates, 1);
    assert_eq!(
        session.stored_field(book::CLASS, dune, book::TITLE)?,
        Some(FieldData::Scalar("Dune (revised)".into()))
    );
    let tags = session
        .stored_field(book::CLASS, dune, book::TAGS)?
        .ok_or("tags not stored")?;
    assert_eq!(sorted(&tags), vec![Value::from("classic"), Value::from("scifi")]);
    Ok(())
}

#[test]
fn attaching_unknown_object_persists_it() -> Result<(), Box<dyn std::error::Error>> {
    let session = TestSession::new()?;
    let (mut ctx, probe) = session.open()?;

    let id = ObjectId::new();
    let mut graph = DetachedGraph::new(id);
    graph.objects.insert(
        id,
        DetachedObject {
            id,
            class_name: author::CLASS.to_string(),
            version: None,
            fields: vec![
                (author::NAME, FieldData::Scalar("Ursula".into())),
                (author::BOOKS, FieldData::Collection(Vec::new())),
            ],
        },
    );

    ctx.begin()?;
    ctx.attach_copy(&graph)?;
    assert_eq!(ctx.lifecycle(id), Some(LifecycleState::PersistentNew));
    ctx.commit()?;

    assert_eq!(probe.counts().inserted, vec![id]);
    assert_eq!(
        session.stored_field(author::CLASS, id, author::NAME)?,
        Some(FieldData::Scalar("Ursula".into()))
    );
    Ok(())
}

#[test]
fn attach_into_second_context_is_rejected_while_owned() -> Result<(), Box<dyn std::error::Error>> {
    let session = TestSession::new()?;
    let (mut owner, _) = session.open()?;
    let (mut other, probe) = session.open()?;
    let (dune, _) = committed_book(&mut owner, "Dune", &[], 1)?;
    let graph = owner.detach_copy(dune)?;

    assert!(matches!(
        other.attach_copy(&graph),
        Err(EngineError::CrossContext(_))
    ));
    assert_eq!(other.managed_count(), 0);
    assert_eq!(probe.counts(), Default::default());
    Ok(())
}
