//! Named monotonic ID ranges.
//!
//! Each name maps to the next unused ID, persisted in the `xayagame_ids`
//! table. The rows are ordinary data rows, so the change journal reverts
//! them together with the game tables: IDs handed out in a rolled-back or
//! detached block are handed out again identically on replay.

use anyhow::Context;
use rusqlite::{
    Connection,
    OptionalExtension,
    params,
};

pub(crate) const IDS_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS `xayagame_ids` (
    `name` TEXT PRIMARY KEY,
    `next_value` INTEGER NOT NULL
);
";

/// Handle to one named ID range.
pub struct IdAllocator<'a> {
    conn: &'a Connection,
    name: &'a str,
}

impl<'a> IdAllocator<'a> {
    pub(crate) fn new(conn: &'a Connection, name: &'a str) -> Self {
        Self { conn, name }
    }

    /// Return the next free ID and advance the counter. The first value of
    /// a fresh range is 1.
    pub fn get_next(&self) -> anyhow::Result<i64> {
        let current: Option<i64> = self
            .conn
            .query_row(
                "SELECT `next_value` FROM `xayagame_ids` WHERE `name` = ?1",
                params![self.name],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("reading id range '{}'", self.name))?;

        let next = current.unwrap_or(1);
        self.conn
            .execute(
                "INSERT INTO `xayagame_ids` (`name`, `next_value`) VALUES (?1, ?2)
                 ON CONFLICT (`name`) DO UPDATE SET `next_value` = excluded.`next_value`",
                params![self.name, next + 1],
            )
            .with_context(|| format!("advancing id range '{}'", self.name))?;
        Ok(next)
    }

    /// Make sure no ID up to and including `value` is handed out again.
    /// Values at or below the current next ID are a no-op.
    pub fn reserve_up_to(&self, value: i64) -> anyhow::Result<()> {
        self.conn
            .execute(
                "INSERT INTO `xayagame_ids` (`name`, `next_value`) VALUES (?1, ?2)
                 ON CONFLICT (`name`) DO UPDATE SET
                     `next_value` = MAX(`next_value`, excluded.`next_value`)",
                params![self.name, value + 1],
            )
            .with_context(|| format!("reserving id range '{}'", self.name))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(IDS_SCHEMA).unwrap();
        conn
    }

    #[test]
    fn fresh_range_starts_at_one() {
        let conn = conn();
        let ids = IdAllocator::new(&conn, "test");
        assert_eq!(ids.get_next().unwrap(), 1);
        assert_eq!(ids.get_next().unwrap(), 2);
        assert_eq!(ids.get_next().unwrap(), 3);
    }

    #[test]
    fn ranges_are_independent() {
        let conn = conn();
        assert_eq!(IdAllocator::new(&conn, "a").get_next().unwrap(), 1);
        assert_eq!(IdAllocator::new(&conn, "a").get_next().unwrap(), 2);
        assert_eq!(IdAllocator::new(&conn, "b").get_next().unwrap(), 1);
    }

    #[test]
    fn reserve_raises_the_floor() {
        let conn = conn();
        let ids = IdAllocator::new(&conn, "r");
        ids.reserve_up_to(9).unwrap();
        assert_eq!(ids.get_next().unwrap(), 10);
    }

    #[test]
    fn reserve_below_current_is_noop() {
        let conn = conn();
        let ids = IdAllocator::new(&conn, "r");
        ids.reserve_up_to(9).unwrap();
        ids.reserve_up_to(4).unwrap();
        assert_eq!(ids.get_next().unwrap(), 10);
        ids.reserve_up_to(5).unwrap();
        assert_eq!(ids.get_next().unwrap(), 11);
    }
}
