use std::collections::HashSet;

use objstate_core::{FieldData, LifecycleState, Value};
use objstate_engine::{EngineError, config::PROPERTY_REACHABILITY_AT_COMMIT};
use objstate_harness::TestSession;
use objstate_harness::fixtures::{
    committed_book, new_author, new_book, new_chapter, new_library,
};
use objstate_harness::model::{author, book, chapter, library};

// ============================================================================
// Walking
// ============================================================================

#[test]
fn transient_cycle_is_visited_once() -> Result<(), Box<dyn std::error::Error>> {
    let session = TestSession::new()?;
    let (mut ctx, probe) = session.open()?;

    let central = new_library(&mut ctx, "Central")?;
    let dune = new_book(&mut ctx, "Dune", &[])?;
    let prologue = new_chapter(&mut ctx, "Prologue", 3)?;
    ctx.set_field(central, library::FEATURED, FieldData::Scalar(Value::Ref(dune)))?;
    ctx.collection_add(dune, book::CHAPTERS, prologue)?;
    ctx.set_field(prologue, chapter::BOOK, FieldData::Scalar(Value::Ref(dune)))?;

    let reachable = ctx.reachable_from(central)?;
    assert_eq!(reachable, HashSet::from([central, dune, prologue]));
    assert_eq!(probe.counts().reads(), 0);

    ctx.begin()?;
    ctx.persist(central)?;
    for id in [central, dune, prologue] {
        assert_eq!(ctx.lifecycle(id), Some(LifecycleState::PersistentNew));
    }
    ctx.commit()?;

    // Referenced objects are inserted before their referrers.
    assert_eq!(probe.counts().inserted, vec![prologue, dune, central]);
    Ok(())
}

#[test]
fn deleted_objects_are_not_reached() -> Result<(), Box<dyn std::error::Error>> {
    let session = TestSession::new()?;
    let (mut ctx, _) = session.open()?;
    let (dune, chapters) = committed_book(&mut ctx, "Dune", &[], 2)?;

    ctx.begin()?;
    ctx.delete(chapters[0])?;
    let reachable = ctx.reachable_from(dune)?;
    assert_eq!(reachable, HashSet::from([dune, chapters[1]]));
    ctx.rollback()?;
    Ok(())
}

#[test]
fn only_enlisted_objects_have_relations_loaded() -> Result<(), Box<dyn std::error::Error>> {
    let session = TestSession::new()?;
    let (mut writer, _) = session.open()?;
    let (mut reader, probe) = session.open()?;
    let (dune, chapters) = committed_book(&mut writer, "Dune", &[], 2)?;
    writer.close()?;

    reader.begin()?;
    reader.find(book::CLASS, dune, false)?;
    for id in &chapters {
        reader.find(chapter::CLASS, *id, false)?;
    }

    // Hollow objects are not enlisted, so nothing is fetched.
    assert_eq!(reader.reachable_from(dune)?, HashSet::from([dune]));
    assert_eq!(probe.counts().reads(), 0);

    reader.read_field(dune, book::TITLE)?;
    assert_eq!(reader.lifecycle(dune), Some(LifecycleState::PersistentClean));
    let reachable = reader.reachable_from(dune)?;
    assert_eq!(reachable, HashSet::from([dune, chapters[0], chapters[1]]));
    // Title, then the relation fields in a single round trip.
    assert_eq!(probe.counts().loads, 2);
    for id in &chapters {
        assert_eq!(reader.lifecycle(*id), Some(LifecycleState::Hollow));
    }
    reader.commit()?;
    Ok(())
}

// ============================================================================
// Commit-time reachability
// ============================================================================

#[test]
fn unreachable_cascaded_object_reverts_to_transient() -> Result<(), Box<dyn std::error::Error>> {
    let session = TestSession::new()?;
    let (mut ctx, probe) = session.open()?;

    ctx.begin()?;
    let central = new_library(&mut ctx, "Central")?;
    let dune = new_book(&mut ctx, "Dune", &[])?;
    ctx.set_field(central, library::FEATURED, FieldData::Scalar(Value::Ref(dune)))?;
    ctx.persist(central)?;
    assert_eq!(ctx.lifecycle(dune), Some(LifecycleState::PersistentNew));

    let ursula = new_author(&mut ctx, "Ursula")?;
    ctx.persist(ursula)?;

    ctx.set_field(central, library::FEATURED, FieldData::null())?;
    ctx.commit()?;

    assert_eq!(ctx.lifecycle(dune), Some(LifecycleState::Transient));
    assert_eq!(session.runtime().ownership().owner_of(dune), None);
    assert_eq!(probe.counts().inserts, 2);
    assert!(session.stored(book::CLASS, dune)?.is_none());
    assert!(session.stored(author::CLASS, ursula)?.is_some());
    assert!(session.stored(library::CLASS, central)?.is_some());
    Ok(())
}

#[test]
fn reachability_check_can_be_switched_off() -> Result<(), Box<dyn std::error::Error>> {
    let session = TestSession::new()?;
    let (mut ctx, probe) = session.open()?;
    ctx.set_property(PROPERTY_REACHABILITY_AT_COMMIT, "false")?;

    ctx.begin()?;
    let central = new_library(&mut ctx, "Central")?;
    let dune = new_book(&mut ctx, "Dune", &[])?;
    ctx.set_field(central, library::FEATURED, FieldData::Scalar(Value::Ref(dune)))?;
    ctx.persist(central)?;
    ctx.set_field(central, library::FEATURED, FieldData::null())?;
    ctx.commit()?;

    assert_eq!(ctx.lifecycle(dune), Some(LifecycleState::PersistentClean));
    assert_eq!(probe.counts().inserts, 2);
    assert!(session.stored(book::CLASS, dune)?.is_some());
    Ok(())
}

#[test]
fn cascade_into_foreign_object_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let session = TestSession::new()?;
    let (mut owner, _) = session.open()?;
    let (mut other, _) = session.open()?;
    let (dune, _) = committed_book(&mut owner, "Dune", &[], 0)?;

    other.begin()?;
    let central = new_library(&mut other, "Central")?;
    other.set_field(central, library::FEATURED, FieldData::Scalar(Value::Ref(dune)))?;
    assert!(matches!(
        other.persist(central),
        Err(EngineError::CrossContext(id)) if id == dune
    ));
    other.rollback()?;
    assert!(!other.is_managed(central));
    Ok(())
}
