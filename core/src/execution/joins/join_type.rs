// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

use std::fmt::{Display, Formatter};

/// Join types of the hash join. The probe side is the left side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    /// Probe rows with at least one match.
    LeftSemiFilter,
    /// All probe rows plus a boolean match column.
    LeftSemiProject,
    /// Build rows with at least one match.
    RightSemiFilter,
    /// All build rows plus a boolean match column.
    RightSemiProject,
    /// Probe rows without a match. With the null-aware flag this is `NOT IN`.
    Anti,
}

impl JoinType {
    /// Build rows must remember whether they were matched, and unmatched or
    /// matched build rows are emitted after probing.
    pub fn need_right_side_join(&self) -> bool {
        matches!(
            self,
            JoinType::Right | JoinType::Full | JoinType::RightSemiFilter | JoinType::RightSemiProject
        )
    }

    /// Rows with null keys stay in the table because they are emitted
    /// unmatched.
    pub fn keeps_null_key_build_rows(&self) -> bool {
        matches!(
            self,
            JoinType::Right | JoinType::Full | JoinType::RightSemiProject
        )
    }

    pub fn is_left_semi(&self) -> bool {
        matches!(self, JoinType::LeftSemiFilter | JoinType::LeftSemiProject)
    }

    pub fn is_right_semi(&self) -> bool {
        matches!(self, JoinType::RightSemiFilter | JoinType::RightSemiProject)
    }

    /// Probe rows without a match are part of the output.
    pub fn emits_unmatched_probe_rows(&self) -> bool {
        matches!(self, JoinType::Left | JoinType::Full)
    }

    /// Output carries the probe columns.
    pub fn outputs_probe_columns(&self) -> bool {
        !self.is_right_semi()
    }

    /// Output carries the build columns.
    pub fn outputs_build_columns(&self) -> bool {
        matches!(
            self,
            JoinType::Inner
                | JoinType::Left
                | JoinType::Right
                | JoinType::Full
                | JoinType::RightSemiFilter
                | JoinType::RightSemiProject
        )
    }

    /// Only the existence of a match matters, so the table keeps one row per
    /// key unless a filter has to look at each of them.
    pub fn allows_duplicate_keys(&self, has_filter: bool) -> bool {
        has_filter || !(self.is_left_semi() || *self == JoinType::Anti)
    }

    pub fn can_be_null_aware(&self) -> bool {
        matches!(self, JoinType::Anti | JoinType::LeftSemiProject)
    }
}

impl Display for JoinType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JoinType::Inner => "INNER",
            JoinType::Left => "LEFT",
            JoinType::Right => "RIGHT",
            JoinType::Full => "FULL",
            JoinType::LeftSemiFilter => "LEFT SEMI (FILTER)",
            JoinType::LeftSemiProject => "LEFT SEMI (PROJECT)",
            JoinType::RightSemiFilter => "RIGHT SEMI (FILTER)",
            JoinType::RightSemiProject => "RIGHT SEMI (PROJECT)",
            JoinType::Anti => "ANTI",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates() {
        assert!(JoinType::Inner.allows_duplicate_keys(false));
        assert!(!JoinType::Anti.allows_duplicate_keys(false));
        assert!(!JoinType::LeftSemiProject.allows_duplicate_keys(false));
        assert!(JoinType::LeftSemiFilter.allows_duplicate_keys(true));
        assert!(JoinType::RightSemiFilter.allows_duplicate_keys(false));
    }

    #[test]
    fn right_side_joins() {
        for t in [
            JoinType::Right,
            JoinType::Full,
            JoinType::RightSemiFilter,
            JoinType::RightSemiProject,
        ] {
            assert!(t.need_right_side_join(), "{t}");
        }
        assert!(!JoinType::Left.need_right_side_join());
        assert!(!JoinType::RightSemiFilter.keeps_null_key_build_rows());
        assert!(!JoinType::RightSemiFilter.outputs_probe_columns());
    }
}
