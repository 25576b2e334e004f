use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use objstate_core::{metadata::ValueStrategy, value::Value};

use crate::error::StorageError;

/// Connection callback for generators that allocate from the datastore.
pub trait SequenceSource {
    /// Reserve `size` consecutive values of `sequence`, returning the first.
    ///
    /// The first value is never below `floor`. Reservations made inside a
    /// transaction that later rolls back are undone in the datastore, so the
    /// caller passes the end of the highest block it already handed out.
    fn allocate_block(
        &mut self,
        sequence: &str,
        size: u64,
        floor: i64,
    ) -> Result<i64, StorageError>;
}

pub trait ValueGenerator: Send {
    fn name(&self) -> &str;

    fn next(&mut self, source: Option<&mut dyn SequenceSource>) -> Result<Value, StorageError>;
}

pub struct UuidGenerator;

impl ValueGenerator for UuidGenerator {
    fn name(&self) -> &str {
        "uuid"
    }

    fn next(&mut self, _source: Option<&mut dyn SequenceSource>) -> Result<Value, StorageError> {
        Ok(Value::Text(uuid::Uuid::now_v7().to_string()))
    }
}

/// Hands out values from blocks reserved in the datastore.
pub struct SequenceGenerator {
    sequence: String,
    block_size: u64,
    next: i64,
    remaining: u64,
    /// One past the last value of every block reserved so far.
    reserved_until: i64,
}

impl SequenceGenerator {
    pub fn new(sequence: &str, block_size: u64) -> Self {
        Self {
            sequence: sequence.to_string(),
            block_size: block_size.max(1),
            next: 0,
            remaining: 0,
            reserved_until: 1,
        }
    }
}

impl ValueGenerator for SequenceGenerator {
    fn name(&self) -> &str {
        &self.sequence
    }

    fn next(&mut self, source: Option<&mut dyn SequenceSource>) -> Result<Value, StorageError> {
        if self.remaining == 0 {
            let source = source.ok_or_else(|| {
                StorageError::Unsupported(format!(
                    "sequence {} needs a datastore connection",
                    self.sequence
                ))
            })?;
            self.next =
                source.allocate_block(&self.sequence, self.block_size, self.reserved_until)?;
            self.remaining = self.block_size;
            self.reserved_until = self.next + self.block_size as i64;
            tracing::debug!(
                sequence = %self.sequence,
                first = self.next,
                size = self.block_size,
                "allocated sequence block"
            );
        }
        let value = self.next;
        self.next += 1;
        self.remaining -= 1;
        Ok(Value::Integer(value))
    }
}

type SharedGenerator = Arc<Mutex<Box<dyn ValueGenerator>>>;

/// Registry of value generators shared by every unit of work on a runtime.
///
/// Lookup-or-create is serialized by the registry lock; each generator is
/// serialized by its own lock, so two contexts drawing from one sequence
/// never receive the same value.
pub struct ValueGenerationManager {
    generators: Mutex<HashMap<String, SharedGenerator>>,
    block_size: u64,
}

impl Default for ValueGenerationManager {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

pub const DEFAULT_BLOCK_SIZE: u64 = 10;

impl ValueGenerationManager {
    pub fn new(block_size: u64) -> Self {
        Self {
            generators: Mutex::new(HashMap::new()),
            block_size,
        }
    }

    /// Registry key: increment generators are per member, named sequences
    /// and uuid are shared by name.
    fn key_for(member_key: &str, strategy: &ValueStrategy) -> String {
        match strategy {
            ValueStrategy::Increment => format!("increment:{member_key}"),
            ValueStrategy::Uuid => "uuid".to_string(),
            ValueStrategy::Sequence(name) => format!("sequence:{name}"),
        }
    }

    pub fn generator_for(&self, member_key: &str, strategy: &ValueStrategy) -> SharedGenerator {
        let key = Self::key_for(member_key, strategy);
        let mut generators = self.generators.lock();
        let generator = generators.entry(key).or_insert_with(|| {
            let created: Box<dyn ValueGenerator> = match strategy {
                ValueStrategy::Increment => {
                    Box::new(SequenceGenerator::new(member_key, self.block_size))
                }
                ValueStrategy::Uuid => Box::new(UuidGenerator),
                ValueStrategy::Sequence(name) => {
                    Box::new(SequenceGenerator::new(name, self.block_size))
                }
            };
            Arc::new(Mutex::new(created))
        });
        Arc::clone(generator)
    }

    pub fn next_value(
        &self,
        member_key: &str,
        strategy: &ValueStrategy,
        source: Option<&mut dyn SequenceSource>,
    ) -> Result<Value, StorageError> {
        let generator = self.generator_for(member_key, strategy);
        let mut generator = generator.lock();
        let value = generator.next(source)?;
        tracing::debug!(
            member = member_key,
            strategy = strategy.name(),
            generator = generator.name(),
            ?value,
            "generated value"
        );
        Ok(value)
    }

    pub fn generator_count(&self) -> usize {
        self.generators.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[derive(Default)]
    struct CountingSource {
        next: HashMap<String, i64>,
        calls: usize,
    }

    impl SequenceSource for CountingSource {
        fn allocate_block(
            &mut self,
            sequence: &str,
            size: u64,
            floor: i64,
        ) -> Result<i64, StorageError> {
            self.calls += 1;
            let next = self.next.entry(sequence.to_string()).or_insert(1);
            let first = (*next).max(floor);
            *next = first + size as i64;
            Ok(first)
        }
    }

    #[test]
    fn sequence_allocates_in_blocks() {
        let manager = ValueGenerationManager::new(3);
        let mut source = CountingSource::default();
        let strategy = ValueStrategy::Increment;
        let mut values = Vec::new();
        for _ in 0..5 {
            values.push(manager.next_value("Book.serial", &strategy, Some(&mut source)).unwrap());
        }
        assert_eq!(
            values,
            (1..=5).map(Value::Integer).collect::<Vec<_>>()
        );
        assert_eq!(source.calls, 2);
    }

    #[test]
    fn lost_reservation_is_not_reissued() {
        let manager = ValueGenerationManager::new(3);
        let mut source = CountingSource::default();
        let strategy = ValueStrategy::Increment;
        let first = manager.next_value("Book.serial", &strategy, Some(&mut source)).unwrap();
        assert_eq!(first, Value::Integer(1));

        // The datastore forgot the block, as after a rolled-back transaction.
        source.next.clear();
        let rest: Vec<Value> = (0..4)
            .map(|_| manager.next_value("Book.serial", &strategy, Some(&mut source)).unwrap())
            .collect();
        assert_eq!(rest, (2..=5).map(Value::Integer).collect::<Vec<_>>());
    }

    #[test]
    fn named_sequences_are_shared_across_members() {
        let manager = ValueGenerationManager::default();
        let strategy = ValueStrategy::Sequence("global".into());
        manager.generator_for("A.id", &strategy);
        manager.generator_for("B.id", &strategy);
        manager.generator_for("A.n", &ValueStrategy::Increment);
        assert_eq!(manager.generator_count(), 2);
    }

    #[test]
    fn sequence_without_source_fails() {
        let manager = ValueGenerationManager::default();
        let err = manager
            .next_value("A.n", &ValueStrategy::Increment, None)
            .unwrap_err();
        assert!(matches!(err, StorageError::Unsupported(_)));
        assert!(manager.next_value("A.u", &ValueStrategy::Uuid, None).is_ok());
    }

    #[test]
    fn concurrent_draws_are_unique() {
        let manager = Arc::new(ValueGenerationManager::new(4));
        let source = Arc::new(Mutex::new(CountingSource::default()));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let source = Arc::clone(&source);
                thread::spawn(move || {
                    let mut drawn = Vec::new();
                    for _ in 0..25 {
                        let mut source = source.lock();
                        let value = manager
                            .next_value("Shared.n", &ValueStrategy::Increment, Some(&mut *source))
                            .unwrap();
                        drawn.push(value);
                    }
                    drawn
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for value in handle.join().unwrap() {
                assert!(all.insert(value));
            }
        }
        assert_eq!(all.len(), 100);
    }
}
