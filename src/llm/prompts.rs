use minijinja::{context, Environment};

const GENERATE_SYSTEM: &str = "generate_system.txt";
const REPORT_SYSTEM: &str = "report_system.txt";
const REPORT_USER: &str = "report_user.txt";

/// Prompt templates compiled once at startup.
pub struct PromptLibrary {
    env: Environment<'static>,
}

impl PromptLibrary {
    pub fn new() -> Result<Self, minijinja::Error> {
        let mut env = Environment::new();
        env.add_template(GENERATE_SYSTEM, include_str!("../../templates/generate_system.txt"))?;
        env.add_template(REPORT_SYSTEM, include_str!("../../templates/report_system.txt"))?;
        env.add_template(REPORT_USER, include_str!("../../templates/report_user.txt"))?;
        Ok(Self { env })
    }

    /// System prompt for SQL generation: schema description plus numbered rules.
    pub fn generation_system(
        &self,
        schema: &str,
        extra_rules: &[String],
    ) -> Result<String, minijinja::Error> {
        self.env
            .get_template(GENERATE_SYSTEM)?
            .render(context! { schema => schema, extra_rules => extra_rules })
    }

    pub fn report_system(&self) -> Result<String, minijinja::Error> {
        self.env.get_template(REPORT_SYSTEM)?.render(context! {})
    }

    /// `question` must already be truncated and stripped of delimiter tags.
    pub fn report_user(
        &self,
        question: &str,
        sql: &str,
        row_count: usize,
        columns: &str,
        preview: &str,
    ) -> Result<String, minijinja::Error> {
        self.env.get_template(REPORT_USER)?.render(context! {
            question => question,
            sql => sql,
            row_count => row_count,
            columns => columns,
            preview => preview,
        })
    }
}
