// DDL Parsing
//
// A small MySQL DDL parser covering the statements that change what the
// catalog tracks about a table: its columns, primary key and unique keys.
// Anything that does not affect those (table options, foreign keys,
// partitioning, defaults) is skipped over.
//
// A DDL text is at most one `USE db` followed by exactly one statement.

use super::CatalogError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    pub schema: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    /// Virtual and stored generated columns never appear in row events.
    pub generated: bool,
    pub primary: bool,
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub name: Option<String>,
    pub primary: bool,
    pub unique: bool,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Position {
    Last,
    First,
    After(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlterSpec {
    AddColumns {
        columns: Vec<ColumnDef>,
        position: Position,
    },
    DropColumn(String),
    ModifyColumn {
        column: ColumnDef,
        position: Position,
    },
    ChangeColumn {
        old: String,
        column: ColumnDef,
        position: Position,
    },
    RenameColumn {
        from: String,
        to: String,
    },
    AddIndex(IndexDef),
    DropPrimaryKey,
    DropIndex(String),
    RenameIndex {
        from: String,
        to: String,
    },
    RenameTable(TableName),
    /// Recognised but irrelevant to keys and columns.
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    CreateDatabase {
        name: String,
        if_not_exists: bool,
    },
    AlterDatabase {
        name: String,
    },
    DropDatabase {
        name: String,
        if_exists: bool,
    },
    CreateTable {
        table: TableName,
        if_not_exists: bool,
        columns: Vec<ColumnDef>,
        indexes: Vec<IndexDef>,
    },
    CreateTableLike {
        table: TableName,
        if_not_exists: bool,
        source: TableName,
    },
    DropTable {
        tables: Vec<TableName>,
        if_exists: bool,
    },
    TruncateTable(TableName),
    RenameTable(Vec<(TableName, TableName)>),
    CreateIndex {
        table: TableName,
        index: IndexDef,
    },
    DropIndex {
        table: TableName,
        name: String,
    },
    AlterTable {
        table: TableName,
        specs: Vec<AlterSpec>,
    },
}

/// A parsed DDL text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ddl {
    /// Database selected by a leading `USE`.
    pub current_schema: Option<String>,
    pub statement: Statement,
}

impl Ddl {
    pub fn parse(text: &str) -> Result<Self, CatalogError> {
        parse_ddl(text).map_err(|reason| CatalogError::InvalidDdl {
            statement: text.to_owned(),
            reason,
        })
    }

    /// Qualify `table` with the `USE` database when it has none.
    pub fn resolve(&self, table: &TableName) -> Result<(String, String), CatalogError> {
        match table.schema.as_ref().or(self.current_schema.as_ref()) {
            Some(schema) => Ok((schema.clone(), table.name.clone())),
            None => Err(CatalogError::InvalidDdl {
                statement: table.name.clone(),
                reason: "no database selected".into(),
            }),
        }
    }

    /// Every table whose structure the statement creates, changes or
    /// removes, qualified. The source of `CREATE TABLE ... LIKE` is only
    /// read and is not listed.
    pub fn tables(&self) -> Result<Vec<(String, String)>, CatalogError> {
        let names: Vec<&TableName> = match &self.statement {
            Statement::CreateDatabase { .. }
            | Statement::AlterDatabase { .. }
            | Statement::DropDatabase { .. } => Vec::new(),
            Statement::CreateTable { table, .. }
            | Statement::CreateTableLike { table, .. }
            | Statement::TruncateTable(table)
            | Statement::CreateIndex { table, .. }
            | Statement::DropIndex { table, .. } => vec![table],
            Statement::AlterTable { table, specs } => std::iter::once(table)
                .chain(specs.iter().filter_map(|spec| match spec {
                    AlterSpec::RenameTable(to) => Some(to),
                    _ => None,
                }))
                .collect(),
            Statement::DropTable { tables, .. } => tables.iter().collect(),
            Statement::RenameTable(pairs) => pairs.iter().flat_map(|(from, to)| [from, to]).collect(),
        };

        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            let table = self.resolve(name)?;
            if !tables.contains(&table) {
                tables.push(table);
            }
        }
        Ok(tables)
    }
}

/// A DDL statement assigned to the stream it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedDdl {
    pub schema: String,
    /// `None` for database level statements.
    pub table: Option<String>,
    pub statement: String,
}

/// Decide which stream(s) a DDL text belongs to.
///
/// Table statements go to their table, renames to the new name, database
/// statements to the database. `DROP TABLE a, b` and multi-pair renames are
/// split into one statement per table.
pub fn route(text: &str) -> Result<Vec<RoutedDdl>, CatalogError> {
    let ddl = Ddl::parse(text)?;
    let single = |schema: String, table: Option<String>| {
        vec![RoutedDdl {
            schema,
            table,
            statement: text.to_owned(),
        }]
    };

    let routes = match &ddl.statement {
        Statement::CreateDatabase { name, .. }
        | Statement::AlterDatabase { name }
        | Statement::DropDatabase { name, .. } => single(name.clone(), None),
        Statement::CreateTable { table, .. }
        | Statement::CreateTableLike { table, .. }
        | Statement::TruncateTable(table)
        | Statement::CreateIndex { table, .. }
        | Statement::DropIndex { table, .. } => {
            let (schema, table) = ddl.resolve(table)?;
            single(schema, Some(table))
        }
        Statement::AlterTable { table, specs } => {
            let renamed = specs.iter().rev().find_map(|spec| match spec {
                AlterSpec::RenameTable(to) => Some(to),
                _ => None,
            });
            let (schema, table) = ddl.resolve(renamed.unwrap_or(table))?;
            single(schema, Some(table))
        }
        Statement::DropTable { tables, if_exists } if tables.len() > 1 => {
            let mut routes = Vec::with_capacity(tables.len());
            for table in tables {
                let (schema, name) = ddl.resolve(table)?;
                let statement = format!(
                    "DROP TABLE {}{}",
                    if *if_exists { "IF EXISTS " } else { "" },
                    quote_table(&schema, &name)
                );
                routes.push(RoutedDdl {
                    schema,
                    table: Some(name),
                    statement,
                });
            }
            routes
        }
        Statement::DropTable { tables, .. } => {
            let mut routes = Vec::new();
            for table in tables {
                let (schema, name) = ddl.resolve(table)?;
                routes.extend(single(schema, Some(name)));
            }
            routes
        }
        Statement::RenameTable(pairs) if pairs.len() > 1 => {
            let mut routes = Vec::with_capacity(pairs.len());
            for (from, to) in pairs {
                let (from_schema, from_name) = ddl.resolve(from)?;
                let (schema, name) = ddl.resolve(to)?;
                let statement = format!(
                    "RENAME TABLE {} TO {}",
                    quote_table(&from_schema, &from_name),
                    quote_table(&schema, &name)
                );
                routes.push(RoutedDdl {
                    schema,
                    table: Some(name),
                    statement,
                });
            }
            routes
        }
        Statement::RenameTable(pairs) => {
            let mut routes = Vec::new();
            for (_, to) in pairs {
                let (schema, name) = ddl.resolve(to)?;
                routes.extend(single(schema, Some(name)));
            }
            routes
        }
    };

    Ok(routes)
}

pub fn quote_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_name(schema), quote_name(table))
}

pub fn quote_name(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Quoted(String),
    Str(String),
    Punct(char),
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn tokenize(text: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                loop {
                    if i + 1 >= chars.len() {
                        return Err("unterminated comment".into());
                    }
                    if chars[i] == '*' && chars[i + 1] == '/' {
                        i += 2;
                        break;
                    }
                    i += 1;
                }
            }
            '`' => {
                let mut ident = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated quoted identifier".into()),
                        Some('`') if chars.get(i + 1) == Some(&'`') => {
                            ident.push('`');
                            i += 2;
                        }
                        Some('`') => {
                            i += 1;
                            break;
                        }
                        Some(c) => {
                            ident.push(*c);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Quoted(ident));
            }
            '\'' | '"' => {
                let quote = c;
                let mut literal = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".into()),
                        Some('\\') => {
                            if let Some(escaped) = chars.get(i + 1) {
                                literal.push(*escaped);
                            }
                            i += 2;
                        }
                        Some(q) if *q == quote && chars.get(i + 1) == Some(&quote) => {
                            literal.push(quote);
                            i += 2;
                        }
                        Some(q) if *q == quote => {
                            i += 1;
                            break;
                        }
                        Some(c) => {
                            literal.push(*c);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(literal));
            }
            c if is_word_char(c) => {
                let start = i;
                while i < chars.len() && is_word_char(chars[i]) {
                    i += 1;
                }
                tokens.push(Token::Word(chars[start..i].iter().collect()));
            }
            c => {
                tokens.push(Token::Punct(c));
                i += 1;
            }
        }
    }

    Ok(tokens)
}

fn parse_ddl(text: &str) -> Result<Ddl, String> {
    let tokens = tokenize(text)?;
    let mut current_schema = None;
    let mut statement = None;

    for part in tokens.split(|t| *t == Token::Punct(';')) {
        if part.is_empty() {
            continue;
        }
        let mut parser = Parser::new(part);
        if parser.eat_keyword("USE") {
            if statement.is_some() {
                return Err("USE must precede the DDL statement".into());
            }
            current_schema = Some(parser.ident()?);
            parser.expect_end()?;
            continue;
        }
        if statement.is_some() {
            return Err("more than one DDL statement".into());
        }
        statement = Some(parser.statement()?);
    }

    match statement {
        Some(statement) => Ok(Ddl {
            current_schema,
            statement,
        }),
        None => Err("no DDL statement".into()),
    }
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn is_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn expect_end(&self) -> Result<(), String> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(format!("unexpected {token:?}")),
        }
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(word)) if word.eq_ignore_ascii_case(keyword))
    }

    fn at_any_keyword(&self, keywords: &[&str]) -> bool {
        keywords.iter().any(|k| self.at_keyword(k))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.at_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Consume the whole keyword sequence or nothing.
    fn eat_keywords(&mut self, keywords: &[&str]) -> bool {
        let matched = keywords.iter().enumerate().all(|(i, keyword)| {
            matches!(self.tokens.get(self.pos + i), Some(Token::Word(word)) if word.eq_ignore_ascii_case(keyword))
        });
        if matched {
            self.pos += keywords.len();
        }
        matched
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), String> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(format!("expected {keyword}, found {:?}", self.peek()))
        }
    }

    fn at_punct(&self, c: char) -> bool {
        self.peek() == Some(&Token::Punct(c))
    }

    fn eat_punct(&mut self, c: char) -> bool {
        if self.at_punct(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, c: char) -> Result<(), String> {
        if self.eat_punct(c) {
            Ok(())
        } else {
            Err(format!("expected `{c}`, found {:?}", self.peek()))
        }
    }

    fn ident(&mut self) -> Result<String, String> {
        match self.peek() {
            Some(Token::Word(name)) | Some(Token::Quoted(name)) => {
                self.pos += 1;
                Ok(name.clone())
            }
            other => Err(format!("expected identifier, found {other:?}")),
        }
    }

    fn table_name(&mut self) -> Result<TableName, String> {
        let first = self.ident()?;
        if self.eat_punct('.') {
            Ok(TableName {
                schema: Some(first),
                name: self.ident()?,
            })
        } else {
            Ok(TableName {
                schema: None,
                name: first,
            })
        }
    }

    /// Skip a parenthesised group, the parser being on its `(`.
    fn skip_group(&mut self) -> Result<(), String> {
        self.expect_punct('(')?;
        let mut depth = 1;
        while depth > 0 {
            match self.peek() {
                None => return Err("unbalanced parentheses".into()),
                Some(Token::Punct('(')) => depth += 1,
                Some(Token::Punct(')')) => depth -= 1,
                _ => {}
            }
            self.pos += 1;
        }
        Ok(())
    }

    /// Skip to the next `,` or `)` of the current nesting level.
    fn skip_element(&mut self) -> Result<(), String> {
        loop {
            match self.peek() {
                None | Some(Token::Punct(',')) | Some(Token::Punct(')')) => return Ok(()),
                Some(Token::Punct('(')) => self.skip_group()?,
                _ => self.pos += 1,
            }
        }
    }

    fn if_exists(&mut self) -> bool {
        self.eat_keywords(&["IF", "EXISTS"])
    }

    fn if_not_exists(&mut self) -> bool {
        self.eat_keywords(&["IF", "NOT", "EXISTS"])
    }

    fn statement(&mut self) -> Result<Statement, String> {
        if self.eat_keyword("CREATE") {
            return self.create();
        }
        if self.eat_keyword("DROP") {
            return self.drop();
        }
        if self.eat_keyword("ALTER") {
            if self.eat_keyword("DATABASE") || self.eat_keyword("SCHEMA") {
                let name = self.ident()?;
                return Ok(Statement::AlterDatabase { name });
            }
            self.expect_keyword("TABLE")?;
            return self.alter_table();
        }
        if self.eat_keyword("TRUNCATE") {
            self.eat_keyword("TABLE");
            let table = self.table_name()?;
            self.expect_end()?;
            return Ok(Statement::TruncateTable(table));
        }
        if self.eat_keyword("RENAME") {
            self.expect_keyword("TABLE")?;
            let mut pairs = Vec::new();
            loop {
                let from = self.table_name()?;
                self.expect_keyword("TO")?;
                let to = self.table_name()?;
                pairs.push((from, to));
                if !self.eat_punct(',') {
                    break;
                }
            }
            self.expect_end()?;
            return Ok(Statement::RenameTable(pairs));
        }
        Err(format!("unsupported statement starting at {:?}", self.peek()))
    }

    fn create(&mut self) -> Result<Statement, String> {
        if self.eat_keyword("DATABASE") || self.eat_keyword("SCHEMA") {
            let if_not_exists = self.if_not_exists();
            let name = self.ident()?;
            return Ok(Statement::CreateDatabase {
                name,
                if_not_exists,
            });
        }
        if self.eat_keyword("TABLE") {
            return self.create_table();
        }

        let unique = self.eat_keyword("UNIQUE");
        if !unique {
            let _ = self.eat_keyword("FULLTEXT") || self.eat_keyword("SPATIAL");
        }
        if self.eat_keyword("INDEX") || self.eat_keyword("KEY") {
            let name = self.ident()?;
            if self.eat_keyword("USING") {
                self.ident()?;
            }
            self.expect_keyword("ON")?;
            let table = self.table_name()?;
            let columns = self.index_columns()?;
            return Ok(Statement::CreateIndex {
                table,
                index: IndexDef {
                    name: Some(name),
                    primary: false,
                    unique,
                    columns,
                },
            });
        }

        Err(format!("unsupported CREATE statement at {:?}", self.peek()))
    }

    fn create_table(&mut self) -> Result<Statement, String> {
        let if_not_exists = self.if_not_exists();
        let table = self.table_name()?;

        let parenthesised_like = self.at_punct('(')
            && matches!(self.tokens.get(self.pos + 1), Some(Token::Word(w)) if w.eq_ignore_ascii_case("LIKE"));
        if parenthesised_like {
            self.pos += 2;
            let source = self.table_name()?;
            self.expect_punct(')')?;
            return Ok(Statement::CreateTableLike {
                table,
                if_not_exists,
                source,
            });
        }
        if self.eat_keyword("LIKE") {
            let source = self.table_name()?;
            return Ok(Statement::CreateTableLike {
                table,
                if_not_exists,
                source,
            });
        }

        if !self.at_punct('(') {
            return Err("CREATE TABLE without a column list".into());
        }
        self.expect_punct('(')?;
        let mut columns = Vec::new();
        let mut indexes = Vec::new();
        loop {
            self.table_element(&mut columns, &mut indexes)?;
            if self.eat_punct(',') {
                continue;
            }
            self.expect_punct(')')?;
            break;
        }

        Ok(Statement::CreateTable {
            table,
            if_not_exists,
            columns,
            indexes,
        })
    }

    fn table_element(
        &mut self,
        columns: &mut Vec<ColumnDef>,
        indexes: &mut Vec<IndexDef>,
    ) -> Result<(), String> {
        if self.eat_keyword("CONSTRAINT")
            && !self.at_any_keyword(&["PRIMARY", "UNIQUE", "FOREIGN", "CHECK"])
        {
            self.ident()?;
        }

        if self.eat_keyword("PRIMARY") {
            self.expect_keyword("KEY")?;
            indexes.push(self.index_body(true, true)?);
        } else if self.eat_keyword("UNIQUE") {
            let _ = self.eat_keyword("KEY") || self.eat_keyword("INDEX");
            indexes.push(self.index_body(false, true)?);
        } else if self.eat_keyword("KEY") || self.eat_keyword("INDEX") {
            indexes.push(self.index_body(false, false)?);
        } else if self.at_any_keyword(&["FULLTEXT", "SPATIAL", "FOREIGN", "CHECK"]) {
            self.skip_element()?;
        } else {
            columns.push(self.column_def()?);
        }
        Ok(())
    }

    /// `[name] [USING type] (columns) [options]`, after the index kind keywords.
    fn index_body(&mut self, primary: bool, unique: bool) -> Result<IndexDef, String> {
        let name = if self.at_punct('(') || self.at_keyword("USING") {
            None
        } else {
            Some(self.ident()?)
        };
        if self.eat_keyword("USING") {
            self.ident()?;
        }
        let columns = self.index_columns()?;
        self.skip_element()?;
        Ok(IndexDef {
            name,
            primary,
            unique,
            columns,
        })
    }

    /// Key parts; functional parts are dropped since no column backs them.
    fn index_columns(&mut self) -> Result<Vec<String>, String> {
        self.expect_punct('(')?;
        let mut columns = Vec::new();
        loop {
            if self.at_punct('(') {
                self.skip_group()?;
            } else {
                columns.push(self.ident()?);
                if self.at_punct('(') {
                    self.skip_group()?;
                }
            }
            let _ = self.eat_keyword("ASC") || self.eat_keyword("DESC");
            if self.eat_punct(',') {
                continue;
            }
            self.expect_punct(')')?;
            return Ok(columns);
        }
    }

    fn column_def(&mut self) -> Result<ColumnDef, String> {
        let mut column = ColumnDef {
            name: self.ident()?,
            generated: false,
            primary: false,
            unique: false,
        };
        // type name
        self.ident()?;

        loop {
            match self.peek() {
                None | Some(Token::Punct(',')) | Some(Token::Punct(')')) => break,
                Some(Token::Punct('(')) => self.skip_group()?,
                _ if self.at_any_keyword(&["FIRST", "AFTER"]) => break,
                _ => {
                    if self.eat_keyword("PRIMARY") {
                        self.expect_keyword("KEY")?;
                        column.primary = true;
                    } else if self.eat_keyword("UNIQUE") {
                        self.eat_keyword("KEY");
                        column.unique = true;
                    } else if self.eat_keyword("KEY") {
                        column.primary = true;
                    } else if self.eat_keyword("GENERATED") || self.eat_keyword("AS") {
                        column.generated = true;
                    } else {
                        self.pos += 1;
                    }
                }
            }
        }

        Ok(column)
    }

    fn position(&mut self) -> Result<Position, String> {
        if self.eat_keyword("FIRST") {
            Ok(Position::First)
        } else if self.eat_keyword("AFTER") {
            Ok(Position::After(self.ident()?))
        } else {
            Ok(Position::Last)
        }
    }

    fn drop(&mut self) -> Result<Statement, String> {
        if self.eat_keyword("DATABASE") || self.eat_keyword("SCHEMA") {
            let if_exists = self.if_exists();
            let name = self.ident()?;
            return Ok(Statement::DropDatabase { name, if_exists });
        }
        if self.eat_keyword("INDEX") || self.eat_keyword("KEY") {
            let name = self.ident()?;
            self.expect_keyword("ON")?;
            let table = self.table_name()?;
            return Ok(Statement::DropIndex { table, name });
        }

        self.eat_keyword("TEMPORARY");
        if !(self.eat_keyword("TABLE") || self.eat_keyword("TABLES")) {
            return Err(format!("unsupported DROP statement at {:?}", self.peek()));
        }
        let if_exists = self.if_exists();
        let mut tables = vec![self.table_name()?];
        while self.eat_punct(',') {
            tables.push(self.table_name()?);
        }
        Ok(Statement::DropTable { tables, if_exists })
    }

    fn alter_table(&mut self) -> Result<Statement, String> {
        let table = self.table_name()?;
        let mut specs = Vec::new();
        while !self.is_end() {
            specs.push(self.alter_spec()?);
            self.skip_element()?;
            if !self.eat_punct(',') {
                self.expect_end()?;
            }
        }
        Ok(Statement::AlterTable { table, specs })
    }

    fn alter_spec(&mut self) -> Result<AlterSpec, String> {
        if self.eat_keyword("ADD") {
            if self.eat_keyword("CONSTRAINT")
                && !self.at_any_keyword(&["PRIMARY", "UNIQUE", "FOREIGN", "CHECK"])
            {
                self.ident()?;
            }
            if self.eat_keyword("PRIMARY") {
                self.expect_keyword("KEY")?;
                return Ok(AlterSpec::AddIndex(self.index_body(true, true)?));
            }
            if self.eat_keyword("UNIQUE") {
                let _ = self.eat_keyword("KEY") || self.eat_keyword("INDEX");
                return Ok(AlterSpec::AddIndex(self.index_body(false, true)?));
            }
            if self.eat_keyword("KEY") || self.eat_keyword("INDEX") {
                return Ok(AlterSpec::AddIndex(self.index_body(false, false)?));
            }
            if self.at_any_keyword(&["FULLTEXT", "SPATIAL", "FOREIGN", "CHECK", "PARTITION"]) {
                return Ok(AlterSpec::Other);
            }

            self.eat_keyword("COLUMN");
            if self.eat_punct('(') {
                let mut columns = vec![self.column_def()?];
                while self.eat_punct(',') {
                    columns.push(self.column_def()?);
                }
                self.expect_punct(')')?;
                return Ok(AlterSpec::AddColumns {
                    columns,
                    position: Position::Last,
                });
            }
            let column = self.column_def()?;
            let position = self.position()?;
            return Ok(AlterSpec::AddColumns {
                columns: vec![column],
                position,
            });
        }

        if self.eat_keyword("DROP") {
            if self.eat_keyword("PRIMARY") {
                self.expect_keyword("KEY")?;
                return Ok(AlterSpec::DropPrimaryKey);
            }
            if self.eat_keyword("INDEX") || self.eat_keyword("KEY") {
                return Ok(AlterSpec::DropIndex(self.ident()?));
            }
            if self.at_any_keyword(&["FOREIGN", "CHECK", "CONSTRAINT", "PARTITION"]) {
                return Ok(AlterSpec::Other);
            }
            self.eat_keyword("COLUMN");
            return Ok(AlterSpec::DropColumn(self.ident()?));
        }

        if self.eat_keyword("MODIFY") {
            self.eat_keyword("COLUMN");
            let column = self.column_def()?;
            let position = self.position()?;
            return Ok(AlterSpec::ModifyColumn { column, position });
        }

        if self.eat_keyword("CHANGE") {
            self.eat_keyword("COLUMN");
            let old = self.ident()?;
            let column = self.column_def()?;
            let position = self.position()?;
            return Ok(AlterSpec::ChangeColumn {
                old,
                column,
                position,
            });
        }

        if self.eat_keyword("RENAME") {
            if self.eat_keyword("COLUMN") {
                let from = self.ident()?;
                self.expect_keyword("TO")?;
                let to = self.ident()?;
                return Ok(AlterSpec::RenameColumn { from, to });
            }
            if self.eat_keyword("INDEX") || self.eat_keyword("KEY") {
                let from = self.ident()?;
                self.expect_keyword("TO")?;
                let to = self.ident()?;
                return Ok(AlterSpec::RenameIndex { from, to });
            }
            let _ = self.eat_keyword("TO") || self.eat_keyword("AS");
            return Ok(AlterSpec::RenameTable(self.table_name()?));
        }

        Ok(AlterSpec::Other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(schema: Option<&str>, name: &str) -> TableName {
        TableName {
            schema: schema.map(str::to_owned),
            name: name.into(),
        }
    }

    #[test]
    fn use_prefix_sets_current_schema() {
        let ddl = Ddl::parse("use test; create table tb1 (a int primary key, b int, c int)").unwrap();
        assert_eq!(ddl.current_schema.as_deref(), Some("test"));
        let Statement::CreateTable { table: name, columns, indexes, .. } = &ddl.statement else {
            panic!("expected create table");
        };
        assert_eq!(name, &table(None, "tb1"));
        assert_eq!(columns.len(), 3);
        assert!(columns[0].primary);
        assert!(indexes.is_empty());
        assert_eq!(ddl.resolve(name).unwrap(), ("test".into(), "tb1".into()));
    }

    #[test]
    fn create_table_with_keys_and_generated_columns() {
        let ddl = Ddl::parse(
            "CREATE TABLE IF NOT EXISTS `shop`.`orders` (
                `id` bigint(20) unsigned NOT NULL AUTO_INCREMENT,
                `code` varchar(32) NOT NULL DEFAULT '' COMMENT 'as in, the code',
                `total` decimal(10,2) GENERATED ALWAYS AS (price * qty) VIRTUAL,
                `alias` int AS (id + 1) STORED,
                price int, qty int,
                PRIMARY KEY (`id`),
                UNIQUE KEY `uk_code` (`code`(16) DESC),
                KEY idx_price (price),
                CONSTRAINT fk FOREIGN KEY (qty) REFERENCES other (id)
            ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 /* trailing */",
        )
        .unwrap();

        let Statement::CreateTable { table: name, if_not_exists, columns, indexes } = ddl.statement else {
            panic!("expected create table");
        };
        assert_eq!(name, table(Some("shop"), "orders"));
        assert!(if_not_exists);
        let generated: Vec<_> = columns.iter().filter(|c| c.generated).map(|c| c.name.as_str()).collect();
        assert_eq!(generated, vec!["total", "alias"]);
        assert_eq!(columns.len(), 6);
        assert_eq!(
            indexes,
            vec![
                IndexDef {
                    name: None,
                    primary: true,
                    unique: true,
                    columns: vec!["id".into()],
                },
                IndexDef {
                    name: Some("uk_code".into()),
                    primary: false,
                    unique: true,
                    columns: vec!["code".into()],
                },
                IndexDef {
                    name: Some("idx_price".into()),
                    primary: false,
                    unique: false,
                    columns: vec!["price".into()],
                },
            ]
        );
    }

    #[test]
    fn alter_table_specs() {
        let ddl = Ddl::parse(
            "alter table t add column d int after a, drop column b, add unique (c, d), \
             modify e varchar(10) first, change f g int, rename column g to h, \
             drop primary key, engine = innodb",
        )
        .unwrap();
        let Statement::AlterTable { specs, .. } = ddl.statement else {
            panic!("expected alter table");
        };
        assert_eq!(specs.len(), 8);
        assert!(matches!(
            &specs[0],
            AlterSpec::AddColumns { columns, position: Position::After(after) }
                if columns[0].name == "d" && after == "a"
        ));
        assert_eq!(specs[1], AlterSpec::DropColumn("b".into()));
        assert!(matches!(&specs[2], AlterSpec::AddIndex(IndexDef { unique: true, columns, .. }) if columns.len() == 2));
        assert!(matches!(&specs[3], AlterSpec::ModifyColumn { position: Position::First, .. }));
        assert!(matches!(&specs[4], AlterSpec::ChangeColumn { old, column, .. } if old == "f" && column.name == "g"));
        assert_eq!(
            specs[5],
            AlterSpec::RenameColumn {
                from: "g".into(),
                to: "h".into()
            }
        );
        assert_eq!(specs[6], AlterSpec::DropPrimaryKey);
        assert_eq!(specs[7], AlterSpec::Other);
    }

    #[test]
    fn rejects_multiple_statements_and_garbage() {
        assert!(matches!(
            Ddl::parse("create database a; create database b"),
            Err(CatalogError::InvalidDdl { .. })
        ));
        assert!(Ddl::parse("select 1").is_err());
        assert!(Ddl::parse("create table t as select * from s").is_err());
        assert!(Ddl::parse("create table t (a int").is_err());
        assert!(Ddl::parse("").is_err());
    }

    #[test]
    fn routes_tables_renames_and_databases() {
        let routes = route("use test; create table t1 (a int)").unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].schema, "test");
        assert_eq!(routes[0].table.as_deref(), Some("t1"));
        assert_eq!(routes[0].statement, "use test; create table t1 (a int)");

        let routes = route("create database test1").unwrap();
        assert_eq!(routes[0].schema, "test1");
        assert!(routes[0].table.is_none());

        let routes = route("rename table a.x to b.y").unwrap();
        assert_eq!((routes[0].schema.as_str(), routes[0].table.as_deref()), ("b", Some("y")));

        let routes = route("alter table a.x rename to a.z").unwrap();
        assert_eq!(routes[0].table.as_deref(), Some("z"));
    }

    #[test]
    fn multi_table_drop_is_split() {
        let routes = route("use test; drop table if exists t1, other.t2").unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].statement, "DROP TABLE IF EXISTS `test`.`t1`");
        assert_eq!(routes[1].statement, "DROP TABLE IF EXISTS `other`.`t2`");
        assert_eq!(routes[1].schema, "other");

        let reparsed = Ddl::parse(&routes[0].statement).unwrap();
        assert!(matches!(reparsed.statement, Statement::DropTable { if_exists: true, .. }));
    }

    #[test]
    fn unqualified_table_without_use_is_rejected() {
        assert!(route("create table t (a int)").is_err());
    }

    #[test]
    fn quoting_escapes_backticks() {
        assert_eq!(quote_table("s", "we`ird"), "`s`.`we``ird`");
        let ddl = Ddl::parse("truncate table `s`.`we``ird`").unwrap();
        assert_eq!(ddl.statement, Statement::TruncateTable(table(Some("s"), "we`ird")));
    }

    #[test]
    fn changed_tables_of_each_statement() {
        let tables = |text: &str| Ddl::parse(text).unwrap().tables().unwrap();
        let key = |s: &str, t: &str| (s.to_string(), t.to_string());

        assert_eq!(tables("rename table s.z to s.b, s.b to s.z"), vec![key("s", "z"), key("s", "b")]);
        assert_eq!(tables("use s; alter table a add column x int, rename to o.a2"), vec![key("s", "a"), key("o", "a2")]);
        assert_eq!(tables("create table s.c like s.a"), vec![key("s", "c")]);
        assert_eq!(tables("use s; drop table a, other.b"), vec![key("s", "a"), key("other", "b")]);
        assert!(tables("drop database s").is_empty());
    }
}
