//! A small library domain covering every field flavour the engine handles:
//! bidirectional relations, dependent collections and maps, cascade persist,
//! versioning and generated values.

use objstate_core::{
    ClassMeta, ContainerShape, FieldMeta, MetadataRegistry, ValueStrategy, ValueType,
};

pub mod author {
    pub const CLASS: &str = "Author";
    pub const NAME: usize = 0;
    /// Inverse of `book::AUTHOR`.
    pub const BOOKS: usize = 1;
}

pub mod book {
    pub const CLASS: &str = "Book";
    pub const TITLE: usize = 0;
    pub const AUTHOR: usize = 1;
    /// Dependent, cascade-persisted list of chapters.
    pub const CHAPTERS: usize = 2;
    pub const TAGS: usize = 3;
    /// Reader name to score.
    pub const RATINGS: usize = 4;
    pub const PRINTED: usize = 5;
}

pub mod chapter {
    pub const CLASS: &str = "Chapter";
    pub const HEADING: usize = 0;
    pub const PAGES: usize = 1;
    /// Back to the owning book; cascade persist closes a cycle.
    pub const BOOK: usize = 2;
}

pub mod library {
    pub const CLASS: &str = "Library";
    pub const NAME: usize = 0;
    /// Cascade persist, not dependent.
    pub const BOOKS: usize = 1;
    /// Shelf label to dependent shelf.
    pub const SHELVES: usize = 2;
    pub const CODE: usize = 3;
    pub const CATALOG: usize = 4;
    pub const UID: usize = 5;
    pub const FEATURED: usize = 6;
}

pub mod shelf {
    pub const CLASS: &str = "Shelf";
    pub const LABEL: usize = 0;
}

pub mod ticket {
    pub const CLASS: &str = "Ticket";
    /// Generated as an integer, declared boolean: never convertible.
    pub const STAMPED: usize = 0;
}

pub fn author_class() -> ClassMeta {
    ClassMeta::new(author::CLASS)
        .field(FieldMeta::scalar("name", ValueType::Text).not_null())
        .field(
            FieldMeta::collection_of("books", ContainerShape::Set, book::CLASS)
                .mapped_by(book::AUTHOR),
        )
}

pub fn book_class() -> ClassMeta {
    ClassMeta::new(book::CLASS)
        .field(FieldMeta::scalar("title", ValueType::Text))
        .field(FieldMeta::reference("author", author::CLASS).mapped_by(author::BOOKS))
        .field(
            FieldMeta::collection_of("chapters", ContainerShape::List, chapter::CLASS)
                .cascade_persist()
                .dependent(),
        )
        .field(FieldMeta::collection("tags", ContainerShape::Set, ValueType::Text).not_null())
        .field(FieldMeta::map("ratings", ContainerShape::SortedMap))
        .field(FieldMeta::mutable_scalar("printed", ValueType::Timestamp))
}

pub fn chapter_class() -> ClassMeta {
    ClassMeta::new(chapter::CLASS)
        .field(FieldMeta::scalar("heading", ValueType::Text))
        .field(FieldMeta::scalar("pages", ValueType::Integer))
        .field(FieldMeta::reference("book", book::CLASS).cascade_persist())
}

pub fn library_class() -> ClassMeta {
    ClassMeta::new(library::CLASS)
        .versioned()
        .field(FieldMeta::scalar("name", ValueType::Text))
        .field(
            FieldMeta::collection_of("books", ContainerShape::Set, book::CLASS).cascade_persist(),
        )
        .field(
            FieldMeta::map("shelves", ContainerShape::Map)
                .with_ref_values(shelf::CLASS)
                .cascade_persist()
                .dependent(),
        )
        .field(FieldMeta::scalar("code", ValueType::Integer).generated(ValueStrategy::Increment))
        .field(
            FieldMeta::scalar("catalog", ValueType::Text)
                .generated(ValueStrategy::Sequence("catalog".into())),
        )
        .field(FieldMeta::scalar("uid", ValueType::Text).generated(ValueStrategy::Uuid))
        .field(FieldMeta::reference("featured", book::CLASS).cascade_persist())
}

pub fn shelf_class() -> ClassMeta {
    ClassMeta::new(shelf::CLASS).field(FieldMeta::scalar("label", ValueType::Text))
}

pub fn ticket_class() -> ClassMeta {
    ClassMeta::new(ticket::CLASS).field(
        FieldMeta::scalar("stamped", ValueType::Boolean).generated(ValueStrategy::Increment),
    )
}

pub fn registry() -> MetadataRegistry {
    MetadataRegistry::new()
        .with_class(author_class())
        .with_class(book_class())
        .with_class(chapter_class())
        .with_class(library_class())
        .with_class(shelf_class())
        .with_class(ticket_class())
}

#[cfg(test)]
mod tests {
    use super::*;
    use objstate_core::MetadataProvider;

    #[test]
    fn field_numbers_match_constants() {
        let registry = registry();
        let book_meta = registry.class(book::CLASS).unwrap();
        assert_eq!(book_meta.field_number("chapters"), Some(book::CHAPTERS));
        assert_eq!(book_meta.field_number("printed"), Some(book::PRINTED));
        assert!(
            book_meta
                .member(book::CHAPTERS)
                .unwrap()
                .container_policy()
                .dependent_elements
        );

        let library_meta = registry.class(library::CLASS).unwrap();
        assert_eq!(library_meta.field_number("featured"), Some(library::FEATURED));
        let shelves = library_meta.member(library::SHELVES).unwrap().container_policy();
        assert!(shelves.dependent_values);
        assert!(!shelves.dependent_keys);
    }
}
