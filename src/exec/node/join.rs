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
use std::fmt;
use std::str::FromStr;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum JoinType {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
    LeftSemi,
    LeftAnti,
}

impl JoinType {
    pub const ALL: [JoinType; 6] = [
        JoinType::Inner,
        JoinType::LeftOuter,
        JoinType::RightOuter,
        JoinType::FullOuter,
        JoinType::LeftSemi,
        JoinType::LeftAnti,
    ];

    /// Left rows without a passing partner are emitted, null-filled on the
    /// right (or alone, for anti).
    pub fn emits_unmatched_left(self) -> bool {
        matches!(
            self,
            JoinType::LeftOuter | JoinType::FullOuter | JoinType::LeftAnti
        )
    }

    pub fn emits_unmatched_right(self) -> bool {
        matches!(self, JoinType::RightOuter | JoinType::FullOuter)
    }

    /// Semi and anti emit each left row at most once and never a right row.
    pub fn is_semi_or_anti(self) -> bool {
        matches!(self, JoinType::LeftSemi | JoinType::LeftAnti)
    }

    /// The join type that gives the same result with the inputs swapped.
    /// Semi and anti have no mirror among the supported types.
    pub fn mirror(self) -> Option<JoinType> {
        match self {
            JoinType::Inner => Some(JoinType::Inner),
            JoinType::LeftOuter => Some(JoinType::RightOuter),
            JoinType::RightOuter => Some(JoinType::LeftOuter),
            JoinType::FullOuter => Some(JoinType::FullOuter),
            JoinType::LeftSemi | JoinType::LeftAnti => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JoinType::Inner => "INNER",
            JoinType::LeftOuter => "LEFT OUTER",
            JoinType::RightOuter => "RIGHT OUTER",
            JoinType::FullOuter => "FULL OUTER",
            JoinType::LeftSemi => "LEFT SEMI",
            JoinType::LeftAnti => "LEFT ANTI",
        }
    }
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JoinType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace(['_', '-'], " ");
        match normalized.as_str() {
            "INNER" => Ok(JoinType::Inner),
            "LEFT" | "LEFT OUTER" => Ok(JoinType::LeftOuter),
            "RIGHT" | "RIGHT OUTER" => Ok(JoinType::RightOuter),
            "FULL" | "FULL OUTER" => Ok(JoinType::FullOuter),
            "SEMI" | "LEFT SEMI" => Ok(JoinType::LeftSemi),
            "ANTI" | "LEFT ANTI" => Ok(JoinType::LeftAnti),
            other => Err(format!("unsupported join type: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_swaps_outer_sides() {
        assert_eq!(JoinType::LeftOuter.mirror(), Some(JoinType::RightOuter));
        assert_eq!(JoinType::FullOuter.mirror(), Some(JoinType::FullOuter));
        assert_eq!(JoinType::LeftAnti.mirror(), None);
    }

    #[test]
    fn parses_common_spellings() {
        assert_eq!("left_outer".parse::<JoinType>(), Ok(JoinType::LeftOuter));
        assert_eq!("ANTI".parse::<JoinType>(), Ok(JoinType::LeftAnti));
        assert!("cross".parse::<JoinType>().is_err());
    }
}
