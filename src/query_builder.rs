use mongodb::bson::{doc, Document};

/// Options of a `find` issued against a [`Collection`](crate::store::Collection).
#[derive(Debug, Default, Clone)]
pub struct QueryBuilder {
    pub r#where: Vec<Document>,
    pub select: Option<Document>,
    pub skip: u64,
    pub limit: i64,
}

impl QueryBuilder {
    pub fn new(filter: Document) -> QueryBuilder {
        QueryBuilder::default().r#where(filter)
    }

    /// Adds a filter condition, conditions are combined with `$and`
    pub fn r#where(mut self, data: Document) -> QueryBuilder {
        if !data.is_empty() {
            self.r#where.push(data);
        }
        self
    }

    /// Sets the projection (field selection)
    pub fn select(mut self, data: Document) -> QueryBuilder {
        self.select = Some(data);
        self
    }

    pub fn skip(mut self, count: u64) -> QueryBuilder {
        self.skip = count;
        self
    }

    /// 0 means no limit
    pub fn limit(mut self, count: i64) -> QueryBuilder {
        self.limit = count;
        self
    }

    pub fn filter(&self) -> Document {
        match self.r#where.as_slice() {
            [] => doc! {},
            [single] => single.clone(),
            many => doc! {"$and": many.to_vec()},
        }
    }
}
